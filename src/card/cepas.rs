//! CEPAS (Singapore): up to 16 purses, each with a transaction history.

use super::{Region, RegionKind, RegionState};
use crate::{Address, Error, Result};

pub const MAX_PURSES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CepasCard {
    pub purses: Vec<Region>,
    pub histories: Vec<Region>,
}

impl CepasCard {
    pub fn new(purses: Vec<Region>, histories: Vec<Region>) -> Result<Self> {
        for (r, at) in purses
            .iter()
            .map(|r| (r, Address::Purse(r.index as u8)))
            .chain(histories.iter().map(|r| (r, Address::History(r.index as u8))))
        {
            if r.index as usize >= MAX_PURSES {
                return Err(Error::OutOfRange(at));
            }
        }
        Ok(Self { purses, histories })
    }

    /// Builds a card from purse and history data by purse number.
    pub fn from_data(purses: Vec<(u8, Vec<u8>)>, histories: Vec<(u8, Vec<u8>)>) -> Result<Self> {
        let wrap = |v: Vec<(u8, Vec<u8>)>| {
            v.into_iter()
                .map(|(i, data)| Region::new(i.into(), RegionKind::File, RegionState::Readable(data)))
                .collect()
        };
        Self::new(wrap(purses), wrap(histories))
    }

    fn find(regions: &[Region], idx: u8, at: Address) -> Result<&[u8]> {
        regions
            .iter()
            .find(|r| r.index == u32::from(idx))
            .ok_or(Error::OutOfRange(at))?
            .data(at)
    }

    pub fn purse(&self, idx: u8) -> Result<&[u8]> {
        Self::find(&self.purses, idx, Address::Purse(idx))
    }

    pub fn history(&self, idx: u8) -> Result<&[u8]> {
        Self::find(&self.histories, idx, Address::History(idx))
    }
}
