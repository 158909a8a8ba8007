//! Reverse engineered Japan Railway Cybernetics Association standards.
//!
//! These structures are used by common transit cards in Japan, but there's no official
//! public documentation, so this is all based on reverse-engineering.
//!
//! https://www.wdic.org/w/RAIL/IC%E3%82%AB%E3%83%BC%E3%83%89%E4%B9%97%E8%BB%8A%E5%88%B8
//! https://ja.osdn.net/projects/felicalib/wiki/suica
//!
//! Station codes: https://www.denno.net/SFCardFan/ (offline as of writing, but on archive.org)
use chrono::{NaiveDate, NaiveTime};
use nom::combinator::map;
use nom::number::complete::{be_u16, be_u24, be_u8, le_u16};
use num_enum::FromPrimitive;

use crate::{codec, IResult};

// I do not know Japanese rail terminology, assume I've mistranslated all of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TerminalType {
    FareAdjustmentMachine = 3, // "精算機"
    HandheldTerminal = 4,      // "携帯型端末"
    OnboardTerminal = 5,       // "車載端末", ie. buses
    #[num_enum(alternatives=[8,18,19,20,21])]
    TicketMachine = 7, // "券売機"
    DepositMachine = 9,        // "入金機 (??)"
    FareGate = 22,             // "改札機"
    SimpleFareGate = 23,       // "簡易改札機"
    #[num_enum(alternatives=[25])]
    CounterTerminal = 24, // "窓口端末"
    FareGateTerminal = 26,     // "改札端末"
    MobilePhone = 27,          // "携帯電話"
    TransferMachine = 28,      // "乗継精算機"
    ContactFareGate = 29,      // "連絡改札機"
    SimpleDepositMachine = 31, // "簡易入金機"
    #[num_enum(alternatives=[72])]
    ViewAltte = 70, // "VIEW ALTTE"
    ProductSalesTerminal = 199, // "物販端末"
    VendingMachine = 200,      // "自販機"
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl TerminalType {
    pub fn is_product_sale(self) -> bool {
        matches!(self, Self::ProductSalesTerminal | Self::VendingMachine)
    }

    pub fn is_ticket_machine(self) -> bool {
        matches!(self, Self::FareAdjustmentMachine | Self::TicketMachine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransactionType {
    ExitFareGate = 1,                  // "運賃支払(改札出場)"
    Charge = 2,                        // "チャージ"
    TicketPurchaseMagnetic = 3,        // "券購(磁気券購入)"
    Adjustment = 4,                    // "精算"
    AdjustmentAtEntrance = 5,          // "精算 (入場精算)"
    AttendantExit = 6,                 // "窓出 (改札窓口処理)"
    NewIssue = 7,                      // "新規 (新規発行)"
    AttendantDebit = 8,                // "控除 (窓口控除)"
    BusPiTaPa = 13,                    // "バス (PiTaPa系)"
    BusIruCa = 15,                     // "バス (IruCa系)"
    Recurring = 17,                    // "再発 (再発行処理)"
    Shinkansen = 19,                   // "支払 (新幹線利用)"
    EntranceAutoCharge = 20,           // "入A (入場時オートチャージ)"
    ExitAutoCharge = 21,               // "出A (出場時オートチャージ)"
    TopUpBusCharge = 31,               // "入金 (バスチャージ)"
    TicketPurchaseSpecialBusTram = 35, // "券購 (バス路面電車企画券購入)"
    ProductSale = 70,                  // "物販"
    Privilege = 72,                    // "特典 (特典チャージ)"
    TopUpCash = 73,                    // "入金 (レジ入金)"
    RefundGoods = 74,                  // "物販取消"
    PurchaseGoods = 75,                // "入物 (入場物販)"
    Reality = 198,                     // "物現 (現金併用物販)"
    Purchase = 203,                    // "入物 (入場現金併用物販)"
    AdjustmentThirdParty = 132,        // "精算 (他社精算)"
    AdjustmentThirdPartyFare = 133,    // "精算 (他社入場精算)"
    #[num_enum(catch_all)]
    Unknown(u8),
}

impl TransactionType {
    /// Puts money on the card rather than taking it off.
    pub fn is_charge(self) -> bool {
        matches!(
            self,
            Self::Charge
                | Self::EntranceAutoCharge
                | Self::ExitAutoCharge
                | Self::TopUpBusCharge
                | Self::Privilege
                | Self::TopUpCash
        )
    }
}

/// Packed date: 7 bits of year since 2000, 4 bits of month, 5 bits of day. Zero if unused.
fn unpack_date(v: u16) -> Option<NaiveDate> {
    if v == 0 {
        return None;
    }
    NaiveDate::from_ymd_opt(
        (((v >> 9) & 0x007f) + 2000).into(),
        ((v >> 5) & 0x000f).into(),
        (v & 0x01f).into(),
    )
}

/// Historical record (also known as an Entry/Exit record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    pub terminal_type: TerminalType,
    pub tx_type: TransactionType,
    pub unknown: u16, // ???
    /// Raw packed date, needed to match taps up with their history record.
    pub date_raw: u16,
    /// Japan local date; None for unused slots on a new card.
    pub date: Option<NaiveDate>,
    /// Entry (line, station), or for buses the line code.
    pub entry: (u8, u8),
    /// Exit (line, station), or for buses the stop code.
    pub exit: (u8, u8),
    pub balance: u16,
    pub sequence: u32,
    pub region: u8,
}

impl HistoryRecord {
    pub fn parse(data: &[u8]) -> IResult<Self> {
        let (data, terminal_type) = map(be_u8, |v| v.into())(data)?;
        let (data, tx_type) = map(be_u8, |v| v.into())(data)?;
        let (data, unknown) = be_u16(data)?;
        let (data, date_raw) = be_u16(data)?;
        let (data, entry) = map(be_u16, |v| ((v >> 8) as u8, v as u8))(data)?;
        let (data, exit) = map(be_u16, |v| ((v >> 8) as u8, v as u8))(data)?;
        let (data, balance) = le_u16(data)?;
        let (data, sequence) = be_u24(data)?;
        let (data, region) = be_u8(data)?;
        Ok((
            data,
            Self {
                terminal_type,
                tx_type,
                unknown,
                date_raw,
                date: unpack_date(date_raw),
                entry,
                exit,
                balance,
                sequence,
                region,
            },
        ))
    }

    pub fn entry_station(&self) -> u16 {
        u16::from_be_bytes([self.entry.0, self.entry.1])
    }

    pub fn exit_station(&self) -> u16 {
        u16::from_be_bytes([self.exit.0, self.exit.1])
    }

    /// Product sales reuse the entry station bytes for the time of day.
    pub fn sale_time(&self) -> Option<NaiveTime> {
        if !self.terminal_type.is_product_sale() {
            return None;
        }
        let raw = [self.entry.0, self.entry.1];
        let hour = codec::bits(&raw, 0, 5).ok()?;
        let minute = codec::bits(&raw, 5, 6).ok()?;
        NaiveTime::from_hms_opt(hour, minute, 0)
    }
}

/// One gate tap from the in/out log, used to put times on fare gate trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapRecord {
    pub tap_on: bool,
    pub station: u16,
    pub date_raw: u16,
    pub time: Option<NaiveTime>,
    pub fare: u16,
}

impl TapRecord {
    pub fn parse(data: &[u8]) -> IResult<Self> {
        let (data, flags) = be_u8(data)?;
        let (data, _) = be_u8(data)?;
        let (data, station) = be_u16(data)?;
        let (data, _) = be_u16(data)?;
        let (data, date_raw) = be_u16(data)?;
        let (data, hour) = be_u8(data)?;
        let (data, minute) = be_u8(data)?;
        let (data, fare) = le_u16(data)?;
        let time = codec::bcd_to_int(hour)
            .and_then(|h| Ok((h, codec::bcd_to_int(minute)?)))
            .ok()
            .and_then(|(h, m)| NaiveTime::from_hms_opt(h.into(), m.into(), 0));
        Ok((
            data,
            Self {
                tap_on: flags & 0x80 != 0,
                station,
                date_raw,
                time,
                fare,
            },
        ))
    }
}
