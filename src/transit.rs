//! Normalized output: what every scheme decoder turns its bytes into.

pub mod pairing;
pub mod zones;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

pub type Timestamp = DateTime<FixedOffset>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Currency {
    AUD,
    CNY,
    HKD,
    JPY,
    SGD,
    USD,
    /// ISO 4217 "no currency", for cards where we don't know what the units are.
    XXX,
}

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Self::AUD => "AUD",
            Self::CNY => "CNY",
            Self::HKD => "HKD",
            Self::JPY => "JPY",
            Self::SGD => "SGD",
            Self::USD => "USD",
            Self::XXX => "XXX",
        }
    }

    /// Number of digits after the decimal point in the minor unit.
    pub fn exponent(self) -> u32 {
        match self {
            Self::JPY | Self::XXX => 0,
            _ => 2,
        }
    }
}

/// An amount of money, in the currency's minor unit (cents, fen, yen...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Money {
    pub amount: i64,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: impl Into<i64>, currency: Currency) -> Self {
        Self {
            amount: amount.into(),
            currency,
        }
    }

    pub fn negate(self) -> Self {
        Self {
            amount: -self.amount,
            ..self
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exp = self.currency.exponent();
        let sign = if self.amount < 0 { "-" } else { "" };
        let abs = self.amount.unsigned_abs();
        if exp == 0 {
            return write!(f, "{} {}{}", self.currency.code(), sign, abs);
        }
        let unit = 10u64.pow(exp);
        write!(
            f,
            "{} {}{}.{:0width$}",
            self.currency.code(),
            sign,
            abs / unit,
            abs % unit,
            width = exp as usize
        )
    }
}

/// A stored-value purse. Cards with more than one purse have more than one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub money: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<Timestamp>,
}

impl From<Money> for Balance {
    fn from(money: Money) -> Self {
        Self {
            money,
            label: None,
            valid_from: None,
            valid_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Bus,
    Train,
    Tram,
    Metro,
    Ferry,
    TicketMachine,
    VendingMachine,
    Pos,
    Other,
    Banned,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bus => "Bus",
            Self::Train => "Train",
            Self::Tram => "Tram",
            Self::Metro => "Metro",
            Self::Ferry => "Ferry",
            Self::TicketMachine => "Ticket machine",
            Self::VendingMachine => "Vending machine",
            Self::Pos => "Point of sale",
            Self::Other => "Other",
            Self::Banned => "Banned",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Latitude, longitude.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,
    /// Fare zone label(s), `/`-separated if the stop straddles zones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl Station {
    /// A station we only know by its numeric id.
    pub fn unknown(id: u32) -> Self {
        Self {
            id: Some(format!("{:#x}", id)),
            name: None,
            position: None,
            zone: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
            position: None,
            zone: None,
        }
    }

    /// A station known by its short code, eg. an MRT station abbreviation.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            id: Some(code.into()),
            name: None,
            position: None,
            zone: None,
        }
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.id) {
            (Some(name), _) => f.write_str(name),
            (None, Some(id)) => write!(f, "Unknown ({})", id),
            (None, None) => f.write_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trip {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fare: Option<Money>,
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_station: Option<Station>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_station: Option<Station>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<String>,
    pub transfer: bool,
}

impl Trip {
    pub fn new(mode: Mode) -> Self {
        Self {
            start: None,
            end: None,
            fare: None,
            mode,
            start_station: None,
            end_station: None,
            route: None,
            agency: None,
            vehicle: None,
            transfer: false,
        }
    }

    /// The time used for ordering: start if known, else end.
    pub fn sort_time(&self) -> Option<Timestamp> {
        self.start.or(self.end)
    }
}

/// Orders trips newest first; trips without any time go last.
pub fn sort_trips(trips: &mut [Trip]) {
    trips.sort_by(|a, b| match (a.sort_time(), b.sort_time()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refill {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<Station>,
    pub automatic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subscription {
    /// A period pass that has been activated.
    TravelPass {
        #[serde(skip_serializing_if = "Option::is_none")]
        valid_until: Option<Timestamp>,
    },
    /// A pass that's been bought but not yet used.
    UnusedPass,
    /// Automatic top-up from a linked bank account.
    AutoTopUp,
}

/// Just enough to tell the user what card this is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitIdentity {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

impl TransitIdentity {
    pub fn new(name: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            name: name.into(),
            serial,
        }
    }
}

/// Everything we managed to decode off a card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitRecord {
    pub card_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    pub balances: Vec<Balance>,
    pub trips: Vec<Trip>,
    pub refills: Vec<Refill>,
    pub subscriptions: Vec<Subscription>,
    /// Scheme-specific labelled facts, in display order.
    pub info: Vec<(String, String)>,
}

impl TransitRecord {
    pub fn new(card_name: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            card_name: card_name.into(),
            serial,
            balances: vec![],
            trips: vec![],
            refills: vec![],
            subscriptions: vec![],
            info: vec![],
        }
    }

    /// The primary balance, if there is one.
    pub fn balance(&self) -> Option<&Balance> {
        self.balances.first()
    }

    pub fn identity(&self) -> TransitIdentity {
        TransitIdentity::new(self.card_name.clone(), self.serial.clone())
    }

    pub fn with_info(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.push((label.into(), value.into()));
        self
    }

    /// Applies output options, eg. hiding card numbers.
    pub fn redacted(mut self, opts: &FormatOptions) -> Self {
        if opts.hide_serials {
            self.serial = self.serial.map(|s| obfuscate(&s));
        }
        self
    }
}

/// Presentation options, passed in explicitly wherever a record is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub hide_serials: bool,
}

/// Masks every digit but the last four.
pub fn obfuscate(serial: &str) -> String {
    let digits = serial.chars().filter(char::is_ascii_alphanumeric).count();
    let mut seen = 0;
    serial
        .chars()
        .map(|c| {
            if !c.is_ascii_alphanumeric() {
                return c;
            }
            seen += 1;
            if seen + 4 > digits {
                c
            } else {
                '*'
            }
        })
        .collect()
}
