//! Myki, Melbourne (MIFARE DESFire).
//!
//! Everything but the card number is locked, so that's all we get.

use super::{desfire, ensure, Scheme};
use crate::card::{Card, DesfireCard, Technology};
use crate::codec;
use crate::transit::{TransitIdentity, TransitRecord};
use crate::{Error, Result};
use tracing::trace_span;

pub const APP_ID_1: u32 = 0x00_11F2;
pub const APP_ID_2: u32 = 0xF0_10F2;
pub const SERIAL_FILE: u8 = 0x0F;

/// 308425 as a little endian u32; the first half of every card number.
pub const HEADER: [u8; 4] = [0xC9, 0xB4, 0x04, 0x00];
pub const PREFIX: u64 = 308425;

pub fn parse_serial(file: &[u8]) -> Result<String> {
    let prefix = codec::int_le(file, 0, 4)?;
    if prefix != PREFIX {
        return Err(Error::Corrupt(format!("unexpected serial prefix {}", prefix)));
    }
    let number = codec::int_le(file, 4, 4)?;
    if number > 99_999_999 {
        return Err(Error::Corrupt(format!("serial out of range: {}", number)));
    }
    let digits = format!("{:06}{:08}", prefix, number);
    let check = codec::luhn_check_digit(&digits)?;
    Ok(format!("{}{}", digits, check))
}

fn serial_file(card: &DesfireCard) -> Result<&[u8]> {
    ensure(card.has_app(APP_ID_1) && card.has_app(APP_ID_2))?;
    let file = card.file(APP_ID_1, SERIAL_FILE)?;
    ensure(file.starts_with(&HEADER))?;
    Ok(file)
}

pub struct Myki;

impl Scheme for Myki {
    fn tag(&self) -> &'static str {
        "myki"
    }

    fn name(&self) -> &'static str {
        "Myki"
    }

    fn technology(&self) -> Technology {
        Technology::Desfire
    }

    fn early_check(&self, card: &Card) -> bool {
        desfire(card).map_or(false, |c| c.has_app(APP_ID_1) && c.has_app(APP_ID_2))
    }

    fn check(&self, card: &Card) -> Result<()> {
        serial_file(desfire(card)?).map(|_| ())
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        let serial = parse_serial(serial_file(desfire(card)?)?)?;
        Ok(TransitIdentity::new(self.name(), Some(serial)))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        let span = trace_span!("myki");
        let _enter = span.enter();

        let serial = parse_serial(serial_file(desfire(card)?)?)?;
        Ok(TransitRecord::new(self.name(), Some(serial))
            .with_info("Note", "Only the card number can be read without keys"))
    }
}
