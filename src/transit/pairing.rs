//! Turning per-tap records into trips.
//!
//! Cards generally log one record per tap rather than one per trip, so a trip with both
//! ends has to be stitched together from a tap-on and a later tap-off.

use super::{Mode, Money, Station, Timestamp, Trip};
use std::cmp::Ordering;

/// One tap (or purchase, or top-up) as logged by a card.
pub trait Transaction {
    fn timestamp(&self) -> Option<Timestamp>;
    fn is_tap_on(&self) -> bool;
    fn is_tap_off(&self) -> bool;
    fn is_cancel(&self) -> bool {
        false
    }

    fn fare(&self) -> Option<Money>;
    fn mode(&self) -> Mode;
    fn station(&self) -> Option<Station> {
        None
    }
    fn agency(&self) -> Option<String> {
        None
    }
    fn route(&self) -> Option<String> {
        None
    }
    fn vehicle(&self) -> Option<String> {
        None
    }
    fn is_transfer(&self) -> bool {
        false
    }

    /// Whether `other` could be the other end of a trip started or ended by `self`.
    fn is_same_trip(&self, other: &Self) -> bool;

    /// Whether `next` closes the trip opened by `self`.
    fn should_be_merged(&self, next: &Self) -> bool {
        self.is_tap_on() && (next.is_tap_off() || next.is_cancel()) && self.is_same_trip(next)
    }
}

/// Up to two transactions making up one trip. At least one side is always present.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionTrip<T> {
    pub start: Option<T>,
    pub end: Option<T>,
}

impl<T: Transaction> TransactionTrip<T> {
    fn opened_by(txn: T) -> Self {
        if txn.is_tap_off() || txn.is_cancel() {
            Self {
                start: None,
                end: Some(txn),
            }
        } else {
            Self {
                start: Some(txn),
                end: None,
            }
        }
    }

    fn any(&self) -> Option<&T> {
        self.start.as_ref().or(self.end.as_ref())
    }

    pub fn fare(&self) -> Option<Money> {
        match &self.end {
            Some(end) if end.is_cancel() => None,
            Some(end) => end.fare().or_else(|| self.start.as_ref().and_then(|s| s.fare())),
            None => self.start.as_ref().and_then(|s| s.fare()),
        }
    }

    pub fn to_trip(&self) -> Trip {
        let any = self.any();
        Trip {
            start: self.start.as_ref().and_then(|t| t.timestamp()),
            end: self.end.as_ref().and_then(|t| t.timestamp()),
            fare: self.fare(),
            mode: any.map(|t| t.mode()).unwrap_or(Mode::Other),
            start_station: self.start.as_ref().and_then(|t| t.station()),
            end_station: self.end.as_ref().and_then(|t| t.station()),
            route: any.and_then(|t| t.route()),
            agency: any.and_then(|t| t.agency()),
            vehicle: any.and_then(|t| t.vehicle()),
            transfer: any.map(|t| t.is_transfer()).unwrap_or(false),
        }
    }
}

/// Stitches transactions into trips, oldest first.
///
/// Timed transactions are walked in order; each one either closes the previous trip (if
/// that trip is still open and agrees to it), or opens a new one. Transactions without a
/// timestamp can't be ordered, so each becomes a trip of its own at the end.
pub fn merge<T: Transaction>(transactions: Vec<T>) -> Vec<TransactionTrip<T>> {
    let (mut timed, timeless): (Vec<T>, Vec<T>) = transactions
        .into_iter()
        .partition(|t| t.timestamp().is_some());
    timed.sort_by_key(|t| t.timestamp());

    let mut trips: Vec<TransactionTrip<T>> = vec![];
    for txn in timed {
        if let Some(last) = trips.last_mut() {
            if last.end.is_none() {
                if let Some(start) = &last.start {
                    if start.should_be_merged(&txn) {
                        last.end = Some(txn);
                        continue;
                    }
                }
            }
        }
        trips.push(TransactionTrip::opened_by(txn));
    }
    trips.extend(timeless.into_iter().map(TransactionTrip::opened_by));
    trips
}

/// A tap that carries a journey id, for schemes that group taps explicitly.
pub trait JourneyTap {
    fn journey(&self) -> u32;
    fn timestamp(&self) -> Option<Timestamp>;
    /// Ticket sales and other non-travel records never pair.
    fn is_sale(&self) -> bool;
    fn mode_code(&self) -> u8;
}

/// Pairs taps sharing a journey id, in (journey, time) order.
///
/// A tap pairs with the tap immediately after it if neither is a sale and both have the
/// same journey id and mode. With `enabled` unset every tap stands alone, which is what
/// you want for systems that never ask passengers to tap off.
pub fn pair_by_journey<T: JourneyTap>(mut taps: Vec<T>, enabled: bool) -> Vec<(T, Option<T>)> {
    taps.sort_by(|a, b| match a.journey().cmp(&b.journey()) {
        Ordering::Equal => a.timestamp().cmp(&b.timestamp()),
        ord => ord,
    });

    let mut out = vec![];
    let mut iter = taps.into_iter().peekable();
    while let Some(tap) = iter.next() {
        let pairs = enabled
            && iter.peek().map_or(false, |next| {
                !tap.is_sale()
                    && !next.is_sale()
                    && tap.journey() == next.journey()
                    && tap.mode_code() == next.mode_code()
            });
        let off = if pairs { iter.next() } else { None };
        out.push((tap, off));
    }
    out
}
