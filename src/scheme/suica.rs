//! Suica and the other Japanese IC cards sharing its FeliCa layout (PASMO, ICOCA, ...).
//!
//! The history service holds the last twenty-odd transactions, newest first, each with
//! the balance left afterwards; fares are worked out from consecutive balances. Fare gate
//! records only carry a date, but the separate in/out tap log has times we can borrow.

pub mod cybernet;

use self::cybernet::{HistoryRecord, TapRecord, TerminalType};
use super::{ensure, felica, zone, Scheme};
use crate::card::{Card, FelicaCard, Region, Technology};
use crate::transit::{
    sort_trips, Balance, Currency, Mode, Money, Refill, Station, Timestamp, TransitIdentity,
    TransitRecord, Trip,
};
use crate::Result;
use chrono::{FixedOffset, Months, NaiveDate, NaiveTime, TimeZone};
use tap::TapFallible;
use tracing::{debug, trace_span, warn};

pub const SYSTEM_CODE: u16 = 0x0003;
pub const SERVICE_HISTORY: u16 = 0x090F;
pub const SERVICE_TAPS: u16 = 0x108F;

/// Balances stay valid for ten years after the last use.
const VALIDITY_MONTHS: u32 = 120;

fn tz() -> FixedOffset {
    zone(9)
}

fn at(date: NaiveDate, time: Option<NaiveTime>) -> Option<Timestamp> {
    tz().from_local_datetime(&date.and_time(time.unwrap_or(NaiveTime::MIN)))
        .single()
}

fn mode(terminal: TerminalType) -> Mode {
    match terminal {
        t if t.is_ticket_machine() => Mode::TicketMachine,
        TerminalType::VendingMachine => Mode::VendingMachine,
        TerminalType::ProductSalesTerminal => Mode::Pos,
        TerminalType::OnboardTerminal => Mode::Bus,
        _ => Mode::Metro,
    }
}

fn history(card: &FelicaCard) -> Result<Vec<HistoryRecord>> {
    card.blocks(SYSTEM_CODE, SERVICE_HISTORY)?
        .into_iter()
        .map(|b| Ok(HistoryRecord::parse(b)?.1))
        .collect()
}

/// The tap log is a nice-to-have; anything wrong with it just means no times.
fn taps(card: &FelicaCard) -> Vec<TapRecord> {
    let Ok(blocks) = card
        .blocks(SYSTEM_CODE, SERVICE_TAPS)
        .tap_err(|err| debug!(?err, "No Suica tap log"))
    else {
        return vec![];
    };
    blocks
        .into_iter()
        .filter_map(|b| {
            TapRecord::parse(b)
                .map(|(_, v)| v)
                .tap_err(|err| warn!(?err, "Bad Suica tap record"))
                .ok()
        })
        .collect()
}

/// Finds the gate taps belonging to a fare gate record, and takes their times.
fn match_taps(
    record: &HistoryRecord,
    fare: Option<i64>,
    taps: &[TapRecord],
    used: &mut Vec<bool>,
) -> (Option<NaiveTime>, Option<NaiveTime>) {
    let mut find = |tap_on: bool, station: u16| {
        let i = taps.iter().enumerate().position(|(i, t)| {
            !used[i]
                && t.tap_on == tap_on
                && t.station == station
                && t.date_raw == record.date_raw
                && (tap_on || Some(i64::from(t.fare)) == fare)
        })?;
        used[i] = true;
        taps[i].time
    };
    let end = find(false, record.exit_station());
    let start = find(true, record.entry_station());
    (start, end)
}

enum Entry {
    Trip(Trip),
    Refill(Refill),
}

fn entry(
    record: &HistoryRecord,
    fare: Option<i64>,
    times: (Option<NaiveTime>, Option<NaiveTime>),
) -> Option<Entry> {
    let date = record.date?;
    let currency = Currency::JPY;

    if record.tx_type.is_charge() && fare.map_or(false, |f| f < 0) {
        return Some(Entry::Refill(Refill {
            time: at(date, None),
            amount: Money::new(-fare.unwrap_or_default(), currency),
            agency: None,
            station: None,
            automatic: false,
        }));
    }

    let terminal = record.terminal_type;
    let mut trip = Trip {
        fare: fare.map(|f| Money::new(f, currency)),
        route: Some(format!("{:?} {:?}", terminal, record.tx_type)),
        ..Trip::new(mode(terminal))
    };
    if terminal.is_product_sale() {
        trip.start = at(date, record.sale_time());
    } else if record.tx_type.is_charge() {
        trip.start = at(date, None);
    } else if terminal == TerminalType::OnboardTerminal {
        trip.start = at(date, None);
        trip.start_station = Some(Station::unknown(record.exit_station().into()));
    } else if terminal.is_ticket_machine() {
        trip.start = at(date, None);
        trip.start_station = Some(Station::unknown(record.entry_station().into()));
    } else {
        let (start, end) = times;
        trip.start = at(date, start);
        trip.end = end.and_then(|t| at(date, Some(t)));
        trip.start_station = Some(Station::unknown(record.entry_station().into()));
        trip.end_station = Some(Station::unknown(record.exit_station().into()));
    }
    Some(Entry::Trip(trip))
}

pub struct Suica;

impl Scheme for Suica {
    fn tag(&self) -> &'static str {
        "suica"
    }

    fn name(&self) -> &'static str {
        "Suica"
    }

    fn technology(&self) -> Technology {
        Technology::Felica
    }

    fn early_check(&self, card: &Card) -> bool {
        felica(card).map_or(false, |c| c.has_system(SYSTEM_CODE))
    }

    /// An empty history is fine, but one with nothing readable belongs to the locked fallback.
    fn check(&self, card: &Card) -> Result<()> {
        let history = felica(card)?
            .system(SYSTEM_CODE)?
            .service(SERVICE_HISTORY)?;
        ensure(history.blocks.is_empty() || history.blocks.iter().any(Region::is_readable))
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        self.check(card)?;
        // Nobody has found the card number yet.
        Ok(TransitIdentity::new(self.name(), None))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        let span = trace_span!("suica");
        let _enter = span.enter();

        let card = felica(card)?;
        let records = history(card)?;
        let taps = taps(card);
        let mut used = vec![false; taps.len()];

        let mut out = TransitRecord::new(self.name(), None);
        for (i, record) in records.iter().enumerate() {
            if record.date.is_none() {
                continue;
            }
            // The oldest record has nothing to compare against.
            let fare = records
                .get(i + 1)
                .filter(|older| older.date.is_some())
                .map(|older| i64::from(older.balance) - i64::from(record.balance));
            let times = if record.terminal_type == TerminalType::FareGate {
                match_taps(record, fare, &taps, &mut used)
            } else {
                (None, None)
            };
            match entry(record, fare, times) {
                Some(Entry::Trip(trip)) => out.trips.push(trip),
                Some(Entry::Refill(refill)) => out.refills.push(refill),
                None => {}
            }
        }

        if let Some(newest) = records.iter().find(|r| r.date.is_some()) {
            let last_used = newest.date.and_then(|d| at(d, None));
            out.balances.push(Balance {
                valid_until: last_used
                    .and_then(|t| t.checked_add_months(Months::new(VALIDITY_MONTHS))),
                ..Balance::from(Money::new(newest.balance, Currency::JPY))
            });
        }
        sort_trips(&mut out.trips);
        Ok(out)
    }
}
