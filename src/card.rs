//! Raw card snapshots.
//!
//! The transport layer (not part of this crate) reads whatever it can off a physical card
//! and hands us a [`Card`]: a tree of [`Region`]s, each of which is either readable, locked
//! behind a key we didn't have, or broken in some other way. Nothing here is ever mutated
//! after construction.

pub mod cepas;
pub mod classic;
pub mod desfire;
pub mod felica;
pub mod iso7816;
pub mod ultralight;

pub use cepas::CepasCard;
pub use classic::{ClassicCard, ClassicSector};
pub use desfire::{DesfireApplication, DesfireCard, DesfireFile, FileKind};
pub use felica::{FelicaCard, FelicaService, FelicaSystem};
pub use iso7816::{Iso7816Application, Iso7816Card, Iso7816File};
pub use ultralight::UltralightCard;

use crate::{Address, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Card technology, ie. which addressing scheme the memory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    Classic,
    Desfire,
    Ultralight,
    Felica,
    Iso7816,
    Cepas,
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Classic => "MIFARE Classic",
            Self::Desfire => "MIFARE DESFire",
            Self::Ultralight => "MIFARE Ultralight",
            Self::Felica => "FeliCa",
            Self::Iso7816 => "ISO 7816",
            Self::Cepas => "CEPAS",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Data,
    Value,
    Trailer,
    Manufacturer,
    File,
    Page,
}

/// What the reader got back when it tried to read a region.
///
/// In dumps: `{"data": "<hex>"}`, `"unauthorized"` or `{"invalid": "<reason>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionState {
    #[serde(rename = "data", with = "hex")]
    Readable(Vec<u8>),
    /// We didn't have the key.
    Unauthorized,
    /// The read failed for some other reason.
    Invalid(String),
}

/// One addressable unit of card memory: a block, a file or a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub index: u32,
    pub kind: RegionKind,
    pub state: RegionState,
}

impl Region {
    pub fn new(index: u32, kind: RegionKind, state: RegionState) -> Self {
        Self { index, kind, state }
    }

    pub fn readable(index: u32, kind: RegionKind, data: impl Into<Vec<u8>>) -> Self {
        Self::new(index, kind, RegionState::Readable(data.into()))
    }

    pub fn is_readable(&self) -> bool {
        matches!(self.state, RegionState::Readable(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.state, RegionState::Unauthorized)
    }

    pub fn readable_data(&self) -> Option<&[u8]> {
        match &self.state {
            RegionState::Readable(data) => Some(data),
            _ => None,
        }
    }

    /// The region's bytes; `at` is only used to say where things went wrong.
    pub fn data(&self, at: Address) -> Result<&[u8]> {
        match &self.state {
            RegionState::Readable(data) => Ok(data),
            RegionState::Unauthorized => Err(Error::AccessDenied(at)),
            RegionState::Invalid(reason) => Err(Error::Corrupt(format!("{}: {}", at, reason))),
        }
    }
}

/// Checks that regions are numbered 0, 1, 2... in order.
pub(crate) fn check_dense(regions: &[Region], at: impl Fn(u32) -> Address) -> Result<()> {
    for (i, region) in regions.iter().enumerate() {
        if region.index as usize != i {
            return Err(Error::OutOfRange(at(region.index)));
        }
    }
    Ok(())
}

/// Technology-specific memory contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    Classic(ClassicCard),
    Desfire(DesfireCard),
    Ultralight(UltralightCard),
    Felica(FelicaCard),
    Iso7816(Iso7816Card),
    Cepas(CepasCard),
}

/// A complete snapshot of one physical read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub tag_id: Vec<u8>,
    pub scanned_at: DateTime<Utc>,
    pub media: Media,
}

impl Card {
    pub fn new(tag_id: impl Into<Vec<u8>>, scanned_at: DateTime<Utc>, media: Media) -> Self {
        Self {
            tag_id: tag_id.into(),
            scanned_at,
            media,
        }
    }

    pub fn technology(&self) -> Technology {
        match self.media {
            Media::Classic(_) => Technology::Classic,
            Media::Desfire(_) => Technology::Desfire,
            Media::Ultralight(_) => Technology::Ultralight,
            Media::Felica(_) => Technology::Felica,
            Media::Iso7816(_) => Technology::Iso7816,
            Media::Cepas(_) => Technology::Cepas,
        }
    }

    pub fn classic(&self) -> Option<&ClassicCard> {
        match &self.media {
            Media::Classic(c) => Some(c),
            _ => None,
        }
    }

    pub fn desfire(&self) -> Option<&DesfireCard> {
        match &self.media {
            Media::Desfire(c) => Some(c),
            _ => None,
        }
    }

    pub fn ultralight(&self) -> Option<&UltralightCard> {
        match &self.media {
            Media::Ultralight(c) => Some(c),
            _ => None,
        }
    }

    pub fn felica(&self) -> Option<&FelicaCard> {
        match &self.media {
            Media::Felica(c) => Some(c),
            _ => None,
        }
    }

    pub fn iso7816(&self) -> Option<&Iso7816Card> {
        match &self.media {
            Media::Iso7816(c) => Some(c),
            _ => None,
        }
    }

    pub fn cepas(&self) -> Option<&CepasCard> {
        match &self.media {
            Media::Cepas(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_data_states() {
        let at = Address::Page(4);
        assert_eq!(
            Region::readable(4, RegionKind::Page, [1, 2, 3, 4])
                .data(at)
                .unwrap(),
            &[1, 2, 3, 4]
        );
        assert!(matches!(
            Region::new(4, RegionKind::Page, RegionState::Unauthorized).data(at),
            Err(Error::AccessDenied(Address::Page(4)))
        ));
        assert!(matches!(
            Region::new(4, RegionKind::Page, RegionState::Invalid("NAK".into())).data(at),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_check_dense() {
        let ok = vec![
            Region::readable(0, RegionKind::Page, [0; 4]),
            Region::readable(1, RegionKind::Page, [0; 4]),
        ];
        assert!(check_dense(&ok, |i| Address::Page(i as u16)).is_ok());

        let gap = vec![
            Region::readable(0, RegionKind::Page, [0; 4]),
            Region::readable(2, RegionKind::Page, [0; 4]),
        ];
        assert!(matches!(
            check_dense(&gap, |i| Address::Page(i as u16)),
            Err(Error::OutOfRange(Address::Page(2)))
        ));
    }
}
