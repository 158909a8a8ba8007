//! ERG (later Videlli, then Vix) MIFARE Classic cards.
//!
//! Sector 0 holds a signature and a metadata block with the card's own epoch. Every other
//! block is a self-describing record, type in the first byte.
//!
//! https://github.com/micolous/metrodroid/wiki/ERG-MFC

use super::{classic, ensure, since_epoch, zone, Scheme};
use crate::card::{Card, ClassicCard, Technology};
use crate::codec;
use crate::transit::{
    sort_trips, Currency, Mode, Money, Refill, Timestamp, TransitIdentity, TransitRecord, Trip,
};
use crate::{Error, Result};
use chrono::FixedOffset;
use tracing::{debug, trace_span, warn};

pub const SIGNATURE: [u8; 7] = [0x32, 0x32, 0x00, 0x00, 0x00, 0x01, 0x01];

const EPOCH: (i32, u32, u32) = (2000, 1, 1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub agency: u16,
    /// Days since 2000-01-01 that all other dates count from.
    pub epoch: u16,
    pub serial: [u8; 4],
}

impl Metadata {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut serial = [0; 4];
        serial.copy_from_slice(codec::slice(data, 7, 4)?);
        Ok(Self {
            agency: codec::int_be(data, 2, 2)? as u16,
            epoch: codec::int_be(data, 5, 2)? as u16,
            serial,
        })
    }

    pub fn serial(&self) -> String {
        hex::encode_upper(self.serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurseKind {
    Debit,
    Credit,
    /// An unpaid trip; paid ones get a debit as well.
    Trip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurseRecord {
    pub kind: PurseKind,
    pub agency: u16,
    /// Days since the card epoch.
    pub day: u32,
    pub minute: u32,
    pub value: u32,
}

impl PurseRecord {
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let kind = match codec::slice(data, 3, 1)?[0] {
            0x09 | 0x0D => PurseKind::Debit,
            0x08 => PurseKind::Credit,
            0x02 => PurseKind::Trip,
            _ => return Ok(None),
        };
        let minute = codec::bits(data, 52, 12)?;
        if minute > 1440 {
            return Err(Error::Corrupt(format!("minute of day out of range: {}", minute)));
        }
        Ok(Some(Self {
            kind,
            agency: codec::int_be(data, 1, 2)? as u16,
            day: codec::bits(data, 32, 20)?,
            minute,
            value: codec::int_be(data, 8, 4)? as u32,
        }))
    }

    pub fn timestamp(&self, epoch: u16, tz: FixedOffset) -> Result<Timestamp> {
        since_epoch(
            tz,
            EPOCH,
            i64::from(epoch) + i64::from(self.day),
            i64::from(self.minute) * 60,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceRecord {
    pub version: u16,
    pub balance: i32,
}

impl BalanceRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            version: codec::int_be(data, 1, 2)? as u16,
            balance: codec::int_be(data, 11, 4)? as u32 as i32,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Balance(BalanceRecord),
    Purse(PurseRecord),
}

impl Record {
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        match codec::slice(data, 0, 1)?[0] {
            0x01 => Ok(Some(Self::Balance(BalanceRecord::parse(data)?))),
            0x02 => Ok(PurseRecord::parse(data)?.map(Self::Purse)),
            _ => Ok(None),
        }
    }
}

fn metadata(card: &ClassicCard) -> Result<Metadata> {
    ensure(codec::slice(card.block(0, 1)?, 0, SIGNATURE.len())? == SIGNATURE)?;
    Metadata::parse(card.block(0, 2)?)
}

/// Every record outside sector 0.
fn records(card: &ClassicCard) -> Vec<Record> {
    card.data_blocks()
        .filter(|(sector, _)| *sector > 0)
        .filter_map(|(sector, region)| {
            let at = crate::Address::Block {
                sector,
                block: region.index as u8,
            };
            let data = region
                .data(at)
                .map_err(|err| warn!(?err, "Skipping unreadable block"))
                .ok()?;
            Record::parse(data)
                .map_err(|err| warn!(?err, %at, "Bad record"))
                .ok()
                .flatten()
        })
        .collect()
}

pub struct Erg;

impl Scheme for Erg {
    fn tag(&self) -> &'static str {
        "erg"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["erg.unknown"]
    }

    fn name(&self) -> &'static str {
        "ERG"
    }

    fn technology(&self) -> Technology {
        Technology::Classic
    }

    fn early_check(&self, card: &Card) -> bool {
        classic(card).and_then(metadata).is_ok()
    }

    fn check(&self, card: &Card) -> Result<()> {
        metadata(classic(card)?).map(|_| ())
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        let meta = metadata(classic(card)?)?;
        Ok(TransitIdentity::new(self.name(), Some(meta.serial())))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        let span = trace_span!("erg");
        let _enter = span.enter();

        let card = classic(card)?;
        let meta = metadata(card)?;
        let tz = zone(0);
        let currency = Currency::XXX;
        let epoch = since_epoch(tz, EPOCH, meta.epoch.into(), 0)?;
        let mut out = TransitRecord::new(self.name(), Some(meta.serial()))
            .with_info("Card epoch", epoch.date_naive().to_string())
            .with_info("Agency", format!("{:#06x}", meta.agency));

        let mut balance: Option<BalanceRecord> = None;
        for record in records(card) {
            match record {
                Record::Balance(b) => {
                    if balance.map_or(true, |cur| b.version > cur.version) {
                        balance = Some(b);
                    }
                }
                Record::Purse(p) => {
                    let Ok(time) = p.timestamp(meta.epoch, tz) else {
                        debug!(?p, "Purse record with impossible timestamp");
                        continue;
                    };
                    let agency = Some(format!("{:#06x}", p.agency));
                    match p.kind {
                        PurseKind::Credit => out.refills.push(Refill {
                            time: Some(time),
                            amount: Money::new(p.value, currency),
                            agency,
                            station: None,
                            automatic: false,
                        }),
                        PurseKind::Debit | PurseKind::Trip => out.trips.push(Trip {
                            start: Some(time),
                            fare: (p.kind == PurseKind::Debit)
                                .then(|| Money::new(p.value, currency)),
                            agency,
                            ..Trip::new(Mode::Other)
                        }),
                    }
                }
            }
        }
        out.balances
            .push(Money::new(balance.map_or(0, |b| b.balance), currency).into());
        sort_trips(&mut out.trips);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::classic::tests::card_with;
    use crate::card::Media;
    use chrono::{TimeZone, Utc};

    fn erg_card(blocks: &[(u8, u8, [u8; 16])]) -> Card {
        let mut all = vec![
            (
                0,
                1,
                [0x32, 0x32, 0x00, 0x00, 0x00, 0x01, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            ),
            (
                0,
                2,
                [
                    0x00, 0x00, // ???
                    0x01, 0x23, // Agency 0x0123
                    0x00, //
                    0x1A, 0x0B, // Epoch: 6667 days => 2018-04-03
                    0xDE, 0xAD, 0xBE, 0xEF, // Serial
                    0x00, 0x00, 0x00, 0x00, 0x00,
                ],
            ),
        ];
        all.extend_from_slice(blocks);
        Card::new(
            [0xDE, 0xAD, 0xBE, 0xEF],
            Utc.with_ymd_and_hms(2018, 9, 20, 0, 0, 0).unwrap(),
            Media::Classic(card_with(&all)),
        )
    }

    #[test]
    fn test_purse_record() {
        let data = [
            0x02, // Purse
            0x01, 0x23, // Agency
            0x0D, // Debit
            0x00, 0x00, 0xA1, // Day 10 (20 bits from bit 32), then...
            0x21, // ... minute 0x121 => 04:49
            0x00, 0x00, 0x01, 0x2C, // 300
            0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(
            PurseRecord::parse(&data).unwrap(),
            Some(PurseRecord {
                kind: PurseKind::Debit,
                agency: 0x0123,
                day: 10,
                minute: 0x121,
                value: 300,
            })
        );
    }

    #[test]
    fn test_erg() {
        let card = erg_card(&[
            // Two balances, the newer one wins.
            (1, 0, [0x01, 0x00, 0x05, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x00, 0x03, 0xE8, 0]),
            (1, 1, [0x01, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x00, 0x07, 0xD0, 0]),
            // Debit, 10 days after epoch, 04:49
            (
                2,
                0,
                [
                    0x02, 0x01, 0x23, 0x0D, 0x00, 0x00, 0xA1, 0x21, 0x00, 0x00, 0x01, 0x2C, 0, 0,
                    0, 0,
                ],
            ),
            // Credit
            (
                2,
                1,
                [
                    0x02, 0x01, 0x23, 0x08, 0x00, 0x00, 0xA1, 0x21, 0x00, 0x00, 0x07, 0xD0, 0, 0,
                    0, 0,
                ],
            ),
        ]);
        assert!(Erg.check(&card).is_ok());
        let record = Erg.decode(&card).unwrap();
        assert_eq!(record.serial.as_deref(), Some("DEADBEEF"));
        assert_eq!(record.balance().unwrap().money, Money::new(1000, Currency::XXX));
        assert_eq!(record.trips.len(), 1);
        assert_eq!(record.refills.len(), 1);
        assert_eq!(
            record.trips[0].start,
            Some(zone(0).with_ymd_and_hms(2018, 4, 13, 4, 49, 0).unwrap())
        );
        assert_eq!(record.trips[0].fare, Some(Money::new(300, Currency::XXX)));
    }

    #[test]
    fn test_not_erg() {
        let card = Card::new(
            [0; 4],
            Utc.with_ymd_and_hms(2018, 9, 20, 0, 0, 0).unwrap(),
            Media::Classic(card_with(&[])),
        );
        assert!(matches!(Erg.check(&card), Err(Error::NotThisScheme)));
    }
}
