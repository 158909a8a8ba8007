//! Cubic Nextfare on MIFARE Classic: SEQ Go card, LA Metro TAP, and everything else
//! Cubic sold with the same layout.

pub mod record;

use self::record::{BalanceRecord, ConfigRecord, Record, TransactionRecord};
use super::{classic, ensure, zone, Scheme};
use crate::card::{Card, ClassicCard, Technology};
use crate::codec;
use crate::transit::pairing::{pair_by_journey, JourneyTap};
use crate::transit::{
    sort_trips, Balance, Currency, Mode, Money, Refill, Station, Subscription, Timestamp,
    TransitIdentity, TransitRecord, Trip,
};
use crate::Result;
use chrono::FixedOffset;
use tap::TapFallible;
use tracing::{debug, trace_span, warn};

pub const MANUFACTURER: [u8; 8] = [0x16, 0x18, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F];

pub const SEQ_GO_SYSTEM_CODES: [[u8; 6]; 2] = [
    [0x5A, 0x5B, 0x20, 0x21, 0x22, 0x23],
    [0x20, 0x21, 0x22, 0x23, 0x01, 0x01],
];
pub const LAX_TAP_SYSTEM_CODE: [u8; 6] = [0x01; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Go card, South-East Queensland.
    SeqGo,
    /// Transit Access Pass, Los Angeles.
    LaxTap,
    Unknown,
}

impl Variant {
    fn currency(self) -> Currency {
        match self {
            Self::SeqGo => Currency::AUD,
            Self::LaxTap => Currency::USD,
            Self::Unknown => Currency::XXX,
        }
    }

    fn timezone(self) -> FixedOffset {
        match self {
            Self::SeqGo => zone(10),
            Self::LaxTap => zone(-8),
            Self::Unknown => zone(0),
        }
    }

    /// TAP never asks anyone to tap off.
    fn pairs_taps(self) -> bool {
        self != Self::LaxTap
    }

    fn mode(self, code: u8) -> Mode {
        match (self, code) {
            (Self::SeqGo, 1) => Mode::TicketMachine,
            (Self::SeqGo, 4) => Mode::Bus,
            (Self::SeqGo, 5) => Mode::Train,
            (Self::SeqGo, 18) => Mode::Ferry,
            (Self::LaxTap, 1) => Mode::Metro,
            (Self::LaxTap, _) => Mode::Bus,
            _ => Mode::Other,
        }
    }

    fn agency(self, code: u8) -> Option<String> {
        match (self, code) {
            (Self::LaxTap, 1) => Some("LA Metro".into()),
            (Self::LaxTap, n) => Some(format!("Agency {}", n)),
            _ => None,
        }
    }
}

pub struct Nextfare(pub Variant);

pub const SEQ_GO: Nextfare = Nextfare(Variant::SeqGo);
pub const LAX_TAP: Nextfare = Nextfare(Variant::LaxTap);
pub const NEXTFARE: Nextfare = Nextfare(Variant::Unknown);

/// "0160 " + the LE32 serial in 4-4-3 groups + a Luhn digit over the whole lot.
pub fn format_serial(serial: u32) -> Result<String> {
    let s = format!("0160 {}", codec::format_number(serial.into(), " ", &[4, 4, 3]));
    let check = codec::luhn_check_digit(&s.replace(' ', ""))?;
    Ok(format!("{}{}", s, check))
}

fn serial(card: &ClassicCard) -> Result<String> {
    format_serial(codec::int_le(card.block(0, 0)?, 0, 4)? as u32)
}

/// Matches the manufacturer signature, and returns the system code.
fn system_code(card: &ClassicCard) -> Result<&[u8]> {
    let block1 = card.block(0, 1)?;
    ensure(codec::slice(block1, 1, 8)? == MANUFACTURER)?;
    codec::slice(block1, 9, 6)
}

struct Tap(TransactionRecord);

impl JourneyTap for Tap {
    fn journey(&self) -> u32 {
        self.0.journey.into()
    }
    fn timestamp(&self) -> Option<Timestamp> {
        Some(self.0.timestamp)
    }
    fn is_sale(&self) -> bool {
        self.0.is_sale()
    }
    fn mode_code(&self) -> u8 {
        self.0.mode
    }
}

impl Nextfare {
    fn classify(&self, card: &ClassicCard) -> Result<()> {
        let code = system_code(card)?;
        match self.0 {
            Variant::SeqGo => ensure(SEQ_GO_SYSTEM_CODES.iter().any(|c| c == code)),
            Variant::LaxTap => {
                ensure(code == LAX_TAP_SYSTEM_CODE)?;
                ensure(codec::is_filled(codec::slice(card.block(0, 2)?, 0, 4)?, 0))
            }
            Variant::Unknown => Ok(()),
        }
    }

    fn records(&self, card: &ClassicCard) -> Vec<Record> {
        let tz = self.0.timezone();
        let mut records = vec![];
        for sector in card.sectors.iter().filter(|s| s.index > 0) {
            for block in 0..3u8 {
                let Ok(data) = sector
                    .block(block)
                    .tap_err(|err| warn!(?err, "Skipping unreadable block"))
                else {
                    continue;
                };
                match Record::parse(data, sector.index, block, tz) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(err) => warn!(?err, sector = sector.index, block, "Bad record"),
                }
            }
        }
        records
    }

    fn trip(&self, on: &TransactionRecord, off: Option<&TransactionRecord>) -> Trip {
        let currency = self.0.currency();
        let cost = -on.value - off.map(|t| t.value).unwrap_or(0);
        Trip {
            start: Some(on.timestamp),
            end: off.map(|t| t.timestamp),
            fare: Some(Money::new(cost, currency)),
            start_station: Some(Station::unknown(on.station.into())),
            end_station: off.map(|t| Station::unknown(t.station.into())),
            agency: self.0.agency(on.mode),
            transfer: on.continuation,
            ..Trip::new(self.0.mode(on.mode))
        }
    }
}

impl Scheme for Nextfare {
    fn tag(&self) -> &'static str {
        match self.0 {
            Variant::SeqGo => "nextfare.seq_go",
            Variant::LaxTap => "nextfare.lax_tap",
            Variant::Unknown => "nextfare",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self.0 {
            Variant::SeqGo => &["seq_go"],
            Variant::LaxTap => &["lax_tap"],
            Variant::Unknown => &["nextfare.unknown"],
        }
    }

    fn name(&self) -> &'static str {
        match self.0 {
            Variant::SeqGo => "Go card",
            Variant::LaxTap => "TAP",
            Variant::Unknown => "Nextfare",
        }
    }

    fn technology(&self) -> Technology {
        Technology::Classic
    }

    fn early_check(&self, card: &Card) -> bool {
        classic(card).and_then(|c| self.classify(c)).is_ok()
    }

    fn check(&self, card: &Card) -> Result<()> {
        self.classify(classic(card)?)
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        Ok(TransitIdentity::new(self.name(), Some(serial(classic(card)?)?)))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        let span = trace_span!("nextfare", variant = ?self.0);
        let _enter = span.enter();

        let card = classic(card)?;
        let system_code = system_code(card)?;
        let block2 = card.block(0, 2)?;
        let currency = self.0.currency();
        let mut out = TransitRecord::new(self.name(), Some(serial(card)?))
            .with_info("System code", hex::encode_upper(system_code))
            .with_info("Block 2", hex::encode_upper(block2));

        let mut balances = vec![];
        let mut config: Option<ConfigRecord> = None;
        let mut passes = vec![];
        let mut taps = vec![];
        for record in self.records(card) {
            match record {
                Record::Balance(b) => balances.push(b),
                Record::Config(c) => config = Some(c),
                Record::TravelPass(p) => passes.push(p),
                Record::Transaction(t) => taps.push(Tap(t)),
                Record::Topup(t) => out.refills.push(Refill {
                    time: Some(t.timestamp),
                    amount: Money::new(t.credit, currency),
                    agency: None,
                    station: Some(Station::unknown(t.station.into())),
                    automatic: t.automatic,
                }),
            }
        }

        let current = BalanceRecord::current(balances);
        out.balances.push(Balance {
            valid_until: config.map(|c| c.expiry),
            ..Balance::from(Money::new(current.map_or(0, |b| b.balance), currency))
        });
        if current.map_or(false, |b| b.has_travel_pass) {
            out.subscriptions.push(Subscription::UnusedPass);
        }
        passes.sort_by_key(|p| std::cmp::Reverse(p.version));
        if let Some(pass) = passes.first() {
            out.subscriptions.push(Subscription::TravelPass {
                valid_until: Some(pass.expiry),
            });
        }
        if let Some(config) = config {
            out.info.push(("Ticket type".into(), config.ticket_type.to_string()));
        }

        debug!(taps = taps.len(), "Pairing taps");
        for (on, off) in pair_by_journey(taps, self.0.pairs_taps()) {
            out.trips.push(self.trip(&on.0, off.as_ref().map(|t| &t.0)));
        }
        sort_trips(&mut out.trips);
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::card::classic::tests::card_with;
    use crate::card::Media;
    use chrono::{TimeZone, Utc};

    /// A Nextfare card with the given serial (sector 0 block 0) and system code.
    pub fn nextfare_card(uid: [u8; 4], system_code: [u8; 6], block2: [u8; 16]) -> Card {
        nextfare_card_with(uid, system_code, block2, &[])
    }

    pub fn nextfare_card_with(
        uid: [u8; 4],
        system_code: [u8; 6],
        block2: [u8; 16],
        blocks: &[(u8, u8, [u8; 16])],
    ) -> Card {
        let mut block0 = [0; 16];
        block0[..4].copy_from_slice(&uid);
        let mut block1 = [0; 16];
        block1[1..9].copy_from_slice(&MANUFACTURER);
        block1[9..15].copy_from_slice(&system_code);

        let mut all = vec![(0, 0, block0), (0, 1, block1), (0, 2, block2)];
        all.extend_from_slice(blocks);
        Card::new(
            uid,
            Utc.with_ymd_and_hms(2018, 9, 20, 0, 0, 0).unwrap(),
            Media::Classic(card_with(&all)),
        )
    }

    #[test]
    fn test_format_serial() {
        assert_eq!(format_serial(0x075BCD15).unwrap(), "0160 0012 3456 7893");
    }

    #[test]
    fn test_seq_go() {
        let card = nextfare_card([0x15, 0xCD, 0x5B, 0x07], SEQ_GO_SYSTEM_CODES[0], [0; 16]);
        assert!(SEQ_GO.check(&card).is_ok());
        let record = SEQ_GO.decode(&card).unwrap();
        assert_eq!(record.card_name, "Go card");
        assert_eq!(record.serial.as_deref(), Some("0160 0012 3456 7893"));
        assert_eq!(record.balance().unwrap().money, Money::new(0, Currency::AUD));

        let card = nextfare_card([0xB1, 0x68, 0xDE, 0x3A], SEQ_GO_SYSTEM_CODES[1], [0; 16]);
        let id = SEQ_GO.identify(&card).unwrap();
        assert_eq!(id.serial.as_deref(), Some("0160 0098 7654 3213"));
    }

    #[test]
    fn test_lax_tap() {
        let card = nextfare_card([0xC4, 0x0D, 0xCD, 0xC0], LAX_TAP_SYSTEM_CODE, [0; 16]);
        assert!(SEQ_GO.check(&card).is_err());
        assert!(LAX_TAP.check(&card).is_ok());
        let record = LAX_TAP.decode(&card).unwrap();
        assert_eq!(record.serial.as_deref(), Some("0160 0323 4663 8769"));
        assert_eq!(record.balance().unwrap().money.currency, Currency::USD);
    }

    #[test]
    fn test_unknown_nextfare() {
        let mut block2 = [0; 16];
        for (i, b) in block2.iter_mut().enumerate() {
            *b = if i % 2 == 0 { 0xFF } else { 0x00 };
        }
        let card = nextfare_card([0x89, 0x7D, 0xF8, 0x42], LAX_TAP_SYSTEM_CODE, block2);
        assert!(LAX_TAP.check(&card).is_err());
        assert!(NEXTFARE.check(&card).is_ok());
        let record = NEXTFARE.decode(&card).unwrap();
        assert_eq!(record.serial.as_deref(), Some("0160 0112 3581 3212"));
        assert_eq!(record.balance().unwrap().money.currency, Currency::XXX);
    }

    #[test]
    fn test_seq_go_trips() {
        let tap = |min: u8, value: [u8; 2]| {
            [
                0x31, 0x05, // Train
                0x2F, 0x25, min, 0x42, 0x02, // 2018-09-15 09:xx, journey 0x12
                value[0], value[1], 0x00, 0x00, 0x00, //
                0x10, 0x00, // Station
                0x00, 0x00,
            ]
        };
        let card = nextfare_card_with(
            [0x15, 0xCD, 0x5B, 0x07],
            SEQ_GO_SYSTEM_CODES[0],
            [0; 16],
            &[
                // Balance: $12.34, version 0x12
                (1, 0, [0x01, 0x28, 0xD2, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x12, 0xFF, 0xFF]),
                // Tap on, tap off for $3.20 in total
                (5, 0, tap(0x1E, [0x00, 0x00])),
                (5, 1, tap(0x3C, [0x40, 0x81])),
            ],
        );
        let record = SEQ_GO.decode(&card).unwrap();
        assert_eq!(record.balance().unwrap().money, Money::new(1234, Currency::AUD));
        assert_eq!(record.trips.len(), 1);
        let trip = &record.trips[0];
        let tz = zone(10);
        assert_eq!(trip.mode, Mode::Train);
        assert_eq!(trip.start, Some(tz.with_ymd_and_hms(2018, 9, 15, 9, 2, 0).unwrap()));
        assert_eq!(trip.end, Some(tz.with_ymd_and_hms(2018, 9, 15, 9, 32, 0).unwrap()));
        assert_eq!(trip.fare, Some(Money::new(320, Currency::AUD)));
    }
}
