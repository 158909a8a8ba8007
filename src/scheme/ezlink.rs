//! CEPAS (Singapore): EZ-Link, NETS FlashPay and friends.
//!
//! Everything lives in purse 3. Times count from 1995-01-01 00:00 SGT; dates count days, and
//! history records count seconds.

use super::{cepas, since_epoch, zone, Scheme};
use crate::card::{Card, Technology};
use crate::transit::{
    sort_trips, Balance, Currency, Mode, Money, Refill, Station, Timestamp, TransitIdentity,
    TransitRecord, Trip,
};
use crate::{IResult, Result};
use chrono::FixedOffset;
use nom::bytes::complete::take;
use nom::combinator::map;
use nom::number::complete::{be_i24, be_u16, be_u32, be_u8};
use num_enum::FromPrimitive;
use tap::TapFallible;
use tracing::{debug, trace_span, warn};

pub const PURSE: u8 = 3;
pub const RECORD_SIZE: usize = 16;

const EPOCH: (i32, u32, u32) = (1995, 1, 1);

fn tz() -> FixedOffset {
    zone(8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TransactionType {
    Retail = 1,
    #[num_enum(alternatives=[117])]
    TopUp = 3,
    Service = 4,
    #[num_enum(alternatives=[0xF0])]
    Creation = 5,
    Mrt = 48,
    Bus = 49,
    BusRefund = 118,
    #[num_enum(catch_all)]
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purse {
    pub version: u8,
    pub status: u8,
    /// Cents; may go negative.
    pub balance: i32,
    pub auto_load: i32,
    pub can: Vec<u8>,
    pub csn: Vec<u8>,
    pub expiry_days: u16,
    pub creation_days: u16,
}

impl Purse {
    pub fn parse(data: &[u8]) -> IResult<Self> {
        let (data, version) = be_u8(data)?;
        let (data, status) = be_u8(data)?;
        let (data, balance) = be_i24(data)?;
        let (data, auto_load) = be_i24(data)?;
        let (data, can) = map(take(8usize), <[u8]>::to_vec)(data)?;
        let (data, csn) = map(take(8usize), <[u8]>::to_vec)(data)?;
        let (data, expiry_days) = be_u16(data)?;
        let (data, creation_days) = be_u16(data)?;
        Ok((
            data,
            Self {
                version,
                status,
                balance,
                auto_load,
                can,
                csn,
                expiry_days,
                creation_days,
            },
        ))
    }

    /// The card number printed on the back is the CAN in hex.
    pub fn serial(&self) -> String {
        hex::encode_upper(&self.can)
    }

    pub fn expiry(&self) -> Result<Timestamp> {
        since_epoch(tz(), EPOCH, self.expiry_days.into(), 0)
    }

    pub fn created(&self) -> Result<Timestamp> {
        since_epoch(tz(), EPOCH, self.creation_days.into(), 0)
    }
}

/// Card brand, from the first three digits of the card number.
pub fn issuer(serial: &str) -> &'static str {
    match serial.get(0..3) {
        Some("100") => "EZ-Link",
        Some("111") => "NETS FlashPay",
        _ => "CEPAS",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub kind: TransactionType,
    /// Cents; debits are negative.
    pub amount: i32,
    pub seconds: u32,
    pub user_data: String,
}

impl Transaction {
    pub fn parse(data: &[u8]) -> IResult<Self> {
        let (data, kind) = map(be_u8, |v| v.into())(data)?;
        let (data, amount) = be_i24(data)?;
        let (data, seconds) = be_u32(data)?;
        let (data, user_data) = map(take(8usize), |raw: &[u8]| {
            let (text, _) = encoding_rs::WINDOWS_1252.decode_without_bom_handling(raw);
            text.trim_end_matches('\0').to_string()
        })(data)?;
        Ok((
            data,
            Self {
                kind,
                amount,
                seconds,
                user_data,
            },
        ))
    }

    pub fn time(&self) -> Result<Timestamp> {
        since_epoch(tz(), EPOCH, 0, self.seconds.into())
    }

    /// Bus records whose user data is a service number rather than a station pair.
    fn is_bus_service(&self) -> bool {
        self.kind == TransactionType::Bus
            && (self.user_data.starts_with("SVC") || self.user_data.starts_with("BUS"))
    }

    /// MRT records (and some others) name the entry and exit stations as `AAA-BBB`.
    pub fn stations(&self) -> Option<(&str, &str)> {
        if self.is_bus_service() {
            return None;
        }
        let sep = self.user_data.as_bytes().get(3)?;
        if *sep != b'-' && *sep != b' ' {
            return None;
        }
        let start = self.user_data.get(0..3)?.trim();
        let end = self.user_data.get(4..7)?.trim();
        Some((start, end)).filter(|(s, e)| !s.is_empty() && !e.is_empty())
    }

    /// The service number: four characters after an `SVC` or `BUS` prefix, spaces dropped.
    pub fn bus_route(&self) -> Option<String> {
        if !self.is_bus_service() {
            return None;
        }
        let end = self.user_data.len().min(7);
        let route = self.user_data.get(3..end)?.replace(' ', "");
        Some(route).filter(|r| !r.is_empty())
    }

    fn to_trip(&self, issuer: &str) -> Trip {
        let (mode, route, agency) = match self.kind {
            TransactionType::Mrt => (Mode::Metro, Some("MRT".into()), Some("SMRT".into())),
            TransactionType::Bus => (
                Mode::Bus,
                Some(match self.bus_route() {
                    Some(route) => format!("Bus #{}", route),
                    None => "(Unknown Bus Route)".into(),
                }),
                None,
            ),
            TransactionType::BusRefund => (Mode::Bus, Some("Bus Refund".into()), None),
            TransactionType::Retail => (Mode::Pos, Some("Retail Purchase".into()), None),
            TransactionType::Service => {
                (Mode::Pos, Some("Service Charge".into()), Some(issuer.into()))
            }
            TransactionType::Creation => {
                (Mode::Other, Some("First use".into()), Some(issuer.into()))
            }
            TransactionType::TopUp => (Mode::TicketMachine, Some("Top-up".into()), None),
            TransactionType::Unknown(_) => (Mode::Other, None, None),
        };
        let mut trip = Trip {
            start: self
                .time()
                .tap_err(|err| warn!(?err, "Bad transaction time"))
                .ok(),
            route,
            agency,
            ..Trip::new(mode)
        };
        if self.kind != TransactionType::Creation {
            trip.fare = Some(Money::new(self.amount, Currency::SGD).negate());
            if let Some((start, end)) = self.stations() {
                trip.start_station = Some(Station::code(start));
                trip.end_station = Some(Station::code(end));
            }
        }
        trip
    }

    fn to_refill(&self, issuer: &str) -> Refill {
        Refill {
            time: self
                .time()
                .tap_err(|err| warn!(?err, "Bad top-up time"))
                .ok(),
            amount: Money::new(self.amount, Currency::SGD),
            agency: Some(issuer.to_string()),
            station: None,
            automatic: false,
        }
    }
}

fn purse(card: &Card) -> Result<Purse> {
    let (_, purse) = Purse::parse(cepas(card)?.purse(PURSE)?)?;
    Ok(purse)
}

pub struct EzLink;

impl Scheme for EzLink {
    fn tag(&self) -> &'static str {
        "ezlink"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["cepas"]
    }

    fn name(&self) -> &'static str {
        "EZ-Link"
    }

    fn technology(&self) -> Technology {
        Technology::Cepas
    }

    fn early_check(&self, card: &Card) -> bool {
        cepas(card).map_or(false, |c| {
            c.purses.iter().any(|r| r.index == u32::from(PURSE))
        })
    }

    fn check(&self, card: &Card) -> Result<()> {
        let card = cepas(card)?;
        card.purse(PURSE)?;
        card.history(PURSE)?;
        Ok(())
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        let serial = purse(card)?.serial();
        Ok(TransitIdentity::new(issuer(&serial), Some(serial)))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        let span = trace_span!("ezlink");
        let _enter = span.enter();

        let purse = purse(card)?;
        let serial = purse.serial();
        let issuer = issuer(&serial);
        let mut out = TransitRecord::new(issuer, Some(serial));

        out.balances.push(Balance {
            valid_until: purse
                .expiry()
                .tap_err(|err| warn!(?err, "Bad expiry date"))
                .ok(),
            ..Balance::from(Money::new(purse.balance, Currency::SGD))
        });
        if let Ok(created) = purse.created() {
            out = out.with_info("Issued", created.format("%Y-%m-%d").to_string());
        }
        if purse.auto_load != 0 {
            out = out.with_info(
                "Auto-load amount",
                Money::new(purse.auto_load, Currency::SGD).to_string(),
            );
        }
        out = out.with_info("CSN", hex::encode_upper(&purse.csn));

        let history = cepas(card)?.history(PURSE)?;
        for raw in history.chunks_exact(RECORD_SIZE) {
            if raw.iter().all(|&b| b == 0) {
                continue;
            }
            let tx = match Transaction::parse(raw) {
                Ok((_, tx)) => tx,
                Err(err) => {
                    warn!(?err, "Skipping bad history record");
                    continue;
                }
            };
            debug!(kind = ?tx.kind, amount = tx.amount, "transaction");
            match tx.kind {
                TransactionType::TopUp => out.refills.push(tx.to_refill(issuer)),
                _ => out.trips.push(tx.to_trip(issuer)),
            }
        }
        sort_trips(&mut out.trips);
        Ok(out)
    }
}
