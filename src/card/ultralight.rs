//! MIFARE Ultralight and NTAG: a flat array of 4-byte pages.

use super::{check_dense, Region, RegionKind, RegionState};
use crate::{Address, Error, Result};

pub const MAX_PAGES: usize = 256;
pub const PAGE_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UltralightCard {
    /// Chip model as reported by GET_VERSION, eg. "NTAG213", if known.
    pub model: Option<String>,
    pub pages: Vec<Region>,
}

impl UltralightCard {
    pub fn new(model: Option<String>, pages: Vec<Region>) -> Result<Self> {
        if pages.len() > MAX_PAGES {
            return Err(Error::OutOfRange(Address::Page(pages.len() as u16)));
        }
        check_dense(&pages, |i| Address::Page(i as u16))?;
        Ok(Self { model, pages })
    }

    /// Builds a card from plain page data, with `None` for pages that were locked.
    pub fn from_pages(model: Option<String>, pages: Vec<Option<[u8; 4]>>) -> Result<Self> {
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                Region::new(
                    i as u32,
                    RegionKind::Page,
                    match p {
                        Some(data) => RegionState::Readable(data.to_vec()),
                        None => RegionState::Unauthorized,
                    },
                )
            })
            .collect();
        Self::new(model, pages)
    }

    pub fn page(&self, page: u16) -> Result<&[u8]> {
        let at = Address::Page(page);
        self.pages
            .get(page as usize)
            .ok_or(Error::OutOfRange(at))?
            .data(at)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("")
    }
}
