//! Cubic Nextfare MIFARE Classic records.
//!
//! Every data block outside sector 0 holds one 16-byte record; which kind of record it is
//! depends only on where the block sits.
//!
//! https://github.com/micolous/metrodroid/wiki/Cubic-Nextfare-MFC

use crate::codec;
use crate::scheme::since_epoch;
use crate::transit::Timestamp;
use crate::{Error, Result};
use chrono::FixedOffset;
use std::cmp::Reverse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Balance(BalanceRecord),
    Config(ConfigRecord),
    Topup(TopupRecord),
    TravelPass(TravelPassRecord),
    Transaction(TransactionRecord),
}

impl Record {
    /// Parses the record stored at a position. `Ok(None)` means empty or uninteresting.
    pub fn parse(data: &[u8], sector: u8, block: u8, tz: FixedOffset) -> Result<Option<Self>> {
        Ok(match (sector, block) {
            (1, 0 | 1) => Some(Self::Balance(BalanceRecord::parse(data)?)),
            (1, 2) => Some(Self::Config(ConfigRecord::parse(data, tz)?)),
            (2, _) => TopupRecord::parse(data, tz)?.map(Self::Topup),
            (3, _) => TravelPassRecord::parse(data, tz)?.map(Self::TravelPass),
            (5..=8, _) => TransactionRecord::parse(data, tz)?.map(Self::Transaction),
            _ => None,
        })
    }
}

/// Nextfare's packed date: day, month, year since 2000 and minute of day, little endian.
pub fn unpack_date(data: &[u8], offset: usize, tz: FixedOffset) -> Result<Timestamp> {
    let v = codec::int_le(data, offset, 4)?;
    let day = (v & 0x1f) as u32;
    let month = ((v >> 5) & 0x0f) as u32;
    let year = ((v >> 9) & 0x7f) as i32 + 2000;
    let minute = (v >> 16) & 0x7ff;
    if minute > 1440 {
        return Err(Error::Corrupt(format!("minute of day out of range: {}", minute)));
    }
    since_epoch(tz, (year, month, day), 0, minute as i64 * 60)
}

/// Stored value. There are two copies, and the one with the higher version wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceRecord {
    pub version: u8,
    /// In cents.
    pub balance: i32,
    /// A travel pass has been bought but not yet used.
    pub has_travel_pass: bool,
}

impl BalanceRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let raw = codec::int_le(data, 2, 2)? as i32;
        let balance = if raw & 0x8000 != 0 {
            -(raw & 0x7fff)
        } else if codec::slice(data, 1, 1)?[0] & 0x80 != 0 {
            // Go card keeps the sign up here instead.
            -raw
        } else {
            raw
        };
        Ok(Self {
            version: codec::slice(data, 13, 1)?[0],
            balance,
            has_travel_pass: codec::slice(data, 7, 1)?[0] != 0,
        })
    }

    /// Picks the current balance out of the copies on the card.
    pub fn current(mut balances: Vec<Self>) -> Option<Self> {
        balances.sort_by_key(|b| Reverse(b.version));
        match balances.as_slice() {
            // The version counter wrapped around.
            [a, b] if a.version >= 240 && b.version <= 10 => Some(*b),
            [a, ..] => Some(*a),
            [] => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRecord {
    pub expiry: Timestamp,
    pub ticket_type: u16,
}

impl ConfigRecord {
    pub fn parse(data: &[u8], tz: FixedOffset) -> Result<Self> {
        Ok(Self {
            expiry: unpack_date(data, 4, tz)?,
            ticket_type: codec::int_le(data, 8, 2)? as u16,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopupRecord {
    pub timestamp: Timestamp,
    pub credit: i32,
    pub station: u16,
    pub automatic: bool,
}

impl TopupRecord {
    pub fn parse(data: &[u8], tz: FixedOffset) -> Result<Option<Self>> {
        if codec::is_filled(codec::slice(data, 2, 6)?, 0) {
            return Ok(None);
        }
        Ok(Some(Self {
            timestamp: unpack_date(data, 2, tz)?,
            credit: (codec::int_le(data, 6, 2)? & 0x7fff) as i32,
            station: codec::int_le(data, 12, 2)? as u16,
            automatic: data[0] == 0x31,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TravelPassRecord {
    pub expiry: Timestamp,
    pub version: u8,
}

impl TravelPassRecord {
    pub fn parse(data: &[u8], tz: FixedOffset) -> Result<Option<Self>> {
        if codec::is_filled(codec::slice(data, 2, 4)?, 0) {
            return Ok(None);
        }
        Ok(Some(Self {
            expiry: unpack_date(data, 2, tz)?,
            version: codec::slice(data, 13, 1)?[0],
        }))
    }
}

/// One tap, or a ticket sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionRecord {
    pub kind: u8,
    pub mode: u8,
    pub timestamp: Timestamp,
    pub journey: u16,
    /// Transfer from an earlier trip.
    pub continuation: bool,
    /// Signed, in cents; fares are stored negative.
    pub value: i32,
    pub station: u16,
    pub checksum: u16,
}

impl TransactionRecord {
    pub fn parse(data: &[u8], tz: FixedOffset) -> Result<Option<Self>> {
        let kind = codec::slice(data, 0, 1)?[0];
        // 0x71, 0x79: stored value sales, logged twice. 0x89: no date.
        if matches!(kind, 0x89 | 0x71 | 0x79) {
            return Ok(None);
        }
        if codec::is_filled(codec::slice(data, 1, 8)?, 0) {
            return Ok(None);
        }

        let journey = codec::int_le(data, 5, 2)? as u16;
        let mut value = codec::int_le(data, 7, 2)? as i32;
        if value > 0x8000 {
            value = -(value & 0x7fff);
        }
        Ok(Some(Self {
            kind,
            mode: data[1],
            timestamp: unpack_date(data, 2, tz)?,
            journey: journey >> 5,
            continuation: journey & 0x10 != 0,
            value,
            station: codec::int_le(data, 12, 2)? as u16,
            checksum: codec::int_le(data, 14, 2)? as u16,
        }))
    }

    pub fn is_sale(&self) -> bool {
        self.kind == 0x41
    }
}
