//! Shenzhen Tong, ISO 7816 flavour (the "new" card, as opposed to the FeliCa one).
//!
//! Dates and times are packed BCD. The balance comes from GET BALANCE on purse 0, and has
//! garbage in its top bit.

use super::{iso7816, local, zone, Scheme};
use crate::card::{Card, Iso7816Application, Technology};
use crate::codec;
use crate::transit::{
    sort_trips, Balance, Currency, Mode, Money, Station, Timestamp, TransitIdentity,
    TransitRecord, Trip,
};
use crate::{Error, Result};
use chrono::FixedOffset;
use tap::TapFallible;
use tracing::{trace_span, warn};

pub const APP_NAME: &[u8] = b"PAY.SZT";
pub const INFO_FILE: u16 = 0x15;
pub const TRIPS_FILE: u16 = 0x18;

const TRANSPORT_BUS: u32 = 3;
const TRANSPORT_METRO: u32 = 6;

fn tz() -> FixedOffset {
    zone(8)
}

/// The printed number carries a check digit that makes the digit sum a multiple of ten.
pub fn format_serial(serial: u32) -> String {
    let sum: u32 = serial
        .to_string()
        .chars()
        .filter_map(|c| c.to_digit(10))
        .sum();
    format!("{}({})", serial, (10 - sum % 10) % 10)
}

/// Packed BCD `YYYYMMDD`.
fn bcd_date(data: &[u8], offset: usize) -> Result<Timestamp> {
    let year = codec::bcd_number(data, offset, 2)? as i32;
    let month = codec::bcd_number(data, offset + 2, 1)? as u32;
    let day = codec::bcd_number(data, offset + 3, 1)? as u32;
    local(tz(), (year, month, day), (0, 0, 0))
}

/// Packed BCD `YYYYMMDDhhmmss`.
fn bcd_datetime(data: &[u8], offset: usize) -> Result<Timestamp> {
    let n = |at: usize, len: usize| codec::bcd_number(data, offset + at, len);
    local(
        tz(),
        (n(0, 2)? as i32, n(2, 1)? as u32, n(3, 1)? as u32),
        (n(4, 1)? as u32, n(5, 1)? as u32, n(6, 1)? as u32),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SztTrip {
    pub cost: i32,
    pub kind: u8,
    pub station: u32,
    pub time: Option<Timestamp>,
}

impl SztTrip {
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let cost = codec::int_be(data, 5, 4)? as u32 as i32;
        let time = codec::slice(data, 16, 7)?;
        if cost == 0 && codec::is_filled(time, 0) {
            return Ok(None);
        }
        Ok(Some(Self {
            cost,
            kind: codec::slice(data, 9, 1)?[0],
            station: codec::int_be(data, 12, 4)? as u32,
            time: if codec::is_filled(time, 0xFF) {
                None
            } else {
                Some(bcd_datetime(data, 16)?)
            },
        }))
    }

    pub fn transport(&self) -> u32 {
        self.station >> 28
    }

    pub fn to_trip(&self) -> Trip {
        let mode = match self.transport() {
            TRANSPORT_BUS => Mode::Bus,
            TRANSPORT_METRO => Mode::Metro,
            _ => Mode::Other,
        };
        let mut trip = Trip {
            fare: Some(Money::new(self.cost, Currency::CNY)),
            agency: Some(match self.transport() {
                TRANSPORT_BUS => "Shenzhen Bus".to_string(),
                TRANSPORT_METRO => "Shenzhen Metro".to_string(),
                other => format!("Unknown ({})", other),
            }),
            ..Trip::new(mode)
        };
        if self.transport() == TRANSPORT_METRO {
            // Metro records are written at the exit gate.
            trip.end = self.time;
            trip.end_station = Some(Station {
                name: Some(format!("Gate {:x}", self.station & 0xFF)),
                ..Station::code(format!("{:x}", self.station >> 8))
            });
        } else {
            trip.start = self.time;
        }
        trip
    }
}

fn app(card: &Card) -> Result<&Iso7816Application> {
    iso7816(card)?
        .application(APP_NAME)
        .ok_or(Error::NotThisScheme)
}

fn serial(app: &Iso7816Application) -> Result<u32> {
    Ok(codec::int_le(app.binary(INFO_FILE)?, 16, 4)? as u32)
}

pub struct Shenzhen;

impl Scheme for Shenzhen {
    fn tag(&self) -> &'static str {
        "szt"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["newshenzhen"]
    }

    fn name(&self) -> &'static str {
        "Shenzhen Tong"
    }

    fn technology(&self) -> Technology {
        Technology::Iso7816
    }

    fn early_check(&self, card: &Card) -> bool {
        iso7816(card).map_or(false, |c| c.app_names().contains(&APP_NAME))
    }

    fn check(&self, card: &Card) -> Result<()> {
        app(card)?.binary(INFO_FILE).map(|_| ())
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        let serial = serial(app(card)?)?;
        Ok(TransitIdentity::new(self.name(), Some(format_serial(serial))))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        let span = trace_span!("shenzhen");
        let _enter = span.enter();

        let app = app(card)?;
        let info = app.binary(INFO_FILE)?;
        let mut out = TransitRecord::new(self.name(), Some(format_serial(serial(app)?)));

        let raw = codec::bits(app.balance(0)?, 1, 31)?;
        out.balances.push(Balance {
            valid_from: bcd_date(info, 20)
                .tap_err(|err| warn!(?err, "Bad validity start"))
                .ok(),
            valid_until: bcd_date(info, 24)
                .tap_err(|err| warn!(?err, "Bad validity end"))
                .ok(),
            ..Balance::from(Money::new(codec::sign_merge_31(raw), Currency::CNY))
        });

        for record in app.records(TRIPS_FILE).unwrap_or_default() {
            match SztTrip::parse(record) {
                Ok(Some(trip)) => out.trips.push(trip.to_trip()),
                Ok(None) => {}
                Err(err) => warn!(?err, "Skipping bad trip record"),
            }
        }
        sort_trips(&mut out.trips);
        Ok(out)
    }
}
