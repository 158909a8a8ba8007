//! Identification and decoding of contactless transit card dumps.
//!
//! A [`card::Card`] is a read-only snapshot of whatever the reader managed to pull off a
//! physical card: sectors, files or pages, each either readable, locked or broken. The
//! [`registry::Registry`] works out which issuer format the snapshot belongs to, and the
//! matching [`scheme::Scheme`] turns its bytes into a [`transit::TransitRecord`].

pub mod card;
pub mod codec;
pub mod dump;
pub mod registry;
pub mod scheme;
pub mod transit;

use std::fmt;

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A probe looked at the card and decided it isn't one of its own.
    #[error("not this scheme")]
    NotThisScheme,

    /// A region we needed is locked behind a key we didn't have.
    #[error("access denied: {0}")]
    AccessDenied(Address),

    /// Bytes that passed a signature check turned out to be nonsense.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Addressed a region the card technology physically can't have, or the dump lacks.
    #[error("out of range: {0}")]
    OutOfRange(Address),

    #[error("invalid BCD byte: {0:#04x}")]
    InvalidBcd(u8),

    #[error("bit range {offset}+{width} out of bounds for {len} byte buffer")]
    BitRange {
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("byte range {offset}+{length} out of bounds for {len} byte buffer")]
    ByteRange {
        offset: usize,
        length: usize,
        len: usize,
    },

    #[error("unsupported zone: {0:?}")]
    UnsupportedZone(String),

    #[error("can't determine zones travelled")]
    IndeterminateZones,

    #[error("couldn't parse record: {0:?}")]
    Parse(nom::error::ErrorKind),

    #[error("malformed dump: {0}")]
    Dump(#[from] serde_json::Error),

    #[error("unsupported dump version: {0}")]
    UnsupportedVersion(u32),

    #[error("no scheme with tag {0:?}")]
    UnknownTag(String),
}

impl Error {
    /// True for errors that mean "try the next probe" rather than "stop".
    pub fn is_decline(&self) -> bool {
        matches!(
            self,
            Self::NotThisScheme
                | Self::AccessDenied(_)
                | Self::OutOfRange(_)
                | Self::ByteRange { .. }
                | Self::BitRange { .. }
        )
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Self::Parse(nom::error::ErrorKind::Eof),
            nom::Err::Error(e) | nom::Err::Failure(e) => Self::Parse(e.code),
        }
    }
}

/// Where on a card something lives, for error messages and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Sector(u8),
    Block { sector: u8, block: u8 },
    Page(u16),
    Application(u32),
    File { app: u32, file: u8 },
    System(u16),
    Service { system: u16, service: u16 },
    FelicaBlock { system: u16, service: u16, block: u16 },
    Iso7816File { file: u16 },
    Iso7816Record { file: u16, record: u16 },
    Balance(u8),
    Purse(u8),
    History(u8),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Sector(s) => write!(f, "sector {}", s),
            Self::Block { sector, block } => write!(f, "sector {} block {}", sector, block),
            Self::Page(p) => write!(f, "page {}", p),
            Self::Application(app) => write!(f, "app {:#08x}", app),
            Self::File { app, file } => write!(f, "app {:#08x} file {:#04x}", app, file),
            Self::System(sys) => write!(f, "system {:#06x}", sys),
            Self::Service { system, service } => {
                write!(f, "system {:#06x} service {:#06x}", system, service)
            }
            Self::FelicaBlock {
                system,
                service,
                block,
            } => write!(
                f,
                "system {:#06x} service {:#06x} block {}",
                system, service, block
            ),
            Self::Iso7816File { file } => write!(f, "file {:#06x}", file),
            Self::Iso7816Record { file, record } => {
                write!(f, "file {:#06x} record {}", file, record)
            }
            Self::Balance(idx) => write!(f, "balance {}", idx),
            Self::Purse(idx) => write!(f, "purse {}", idx),
            Self::History(idx) => write!(f, "history {}", idx),
        }
    }
}
