//! MIFARE Classic: sectors of 16-byte blocks, each sector guarded by its own keys.
//!
//! 1K cards have 16 sectors of 4 blocks; 4K cards add 8 more sectors of 16 blocks at the end.
//! The last block of each sector is the trailer holding the keys and access bits, and block 0
//! of sector 0 is the read-only manufacturer block.

use super::{check_dense, Region, RegionKind, RegionState};
use crate::{Address, Error, Result};

pub const MAX_SECTORS: usize = 40;
pub const BLOCK_SIZE: usize = 16;

/// How many blocks a sector at this position physically has.
pub fn blocks_in_sector(sector: usize) -> usize {
    if sector < 32 {
        4
    } else {
        16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicSector {
    pub index: u8,
    pub blocks: Vec<Region>,
}

impl ClassicSector {
    /// A sector we have data for, given its blocks in order.
    pub fn new(index: u8, blocks: Vec<Vec<u8>>) -> Self {
        let last = blocks_in_sector(index.into()) - 1;
        let blocks = blocks
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                Region::readable(i as u32, Self::kind_of(index, i, last), data)
            })
            .collect();
        Self { index, blocks }
    }

    /// A sector none of our keys opened.
    pub fn unauthorized(index: u8) -> Self {
        let count = blocks_in_sector(index.into());
        let blocks = (0..count)
            .map(|i| {
                Region::new(
                    i as u32,
                    Self::kind_of(index, i, count - 1),
                    RegionState::Unauthorized,
                )
            })
            .collect();
        Self { index, blocks }
    }

    pub(crate) fn kind_of(sector: u8, block: usize, last: usize) -> RegionKind {
        match (sector, block) {
            (0, 0) => RegionKind::Manufacturer,
            (_, b) if b == last => RegionKind::Trailer,
            _ => RegionKind::Data,
        }
    }

    /// True if not a single block in the sector could be read.
    pub fn is_unauthorized(&self) -> bool {
        !self.blocks.iter().any(Region::is_readable)
    }

    pub fn block(&self, block: u8) -> Result<&[u8]> {
        let at = Address::Block {
            sector: self.index,
            block,
        };
        self.blocks
            .get(block as usize)
            .ok_or(Error::OutOfRange(at))?
            .data(at)
    }

    /// Data blocks only, ie. everything but the trailer.
    pub fn data_blocks(&self) -> impl Iterator<Item = &Region> {
        self.blocks
            .iter()
            .filter(|b| b.kind != RegionKind::Trailer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicCard {
    pub sectors: Vec<ClassicSector>,
}

impl ClassicCard {
    pub fn new(sectors: Vec<ClassicSector>) -> Result<Self> {
        if sectors.len() > MAX_SECTORS {
            return Err(Error::OutOfRange(Address::Sector(sectors.len() as u8)));
        }
        for (i, sector) in sectors.iter().enumerate() {
            if sector.index as usize != i || sector.blocks.len() > blocks_in_sector(i) {
                return Err(Error::OutOfRange(Address::Sector(sector.index)));
            }
            check_dense(&sector.blocks, |block| Address::Block {
                sector: sector.index,
                block: block as u8,
            })?;
        }
        Ok(Self { sectors })
    }

    pub fn sector(&self, sector: u8) -> Result<&ClassicSector> {
        self.sectors
            .get(sector as usize)
            .ok_or(Error::OutOfRange(Address::Sector(sector)))
    }

    pub fn block(&self, sector: u8, block: u8) -> Result<&[u8]> {
        self.sector(sector)?.block(block)
    }

    /// Every data block of every sector, with its position.
    pub fn data_blocks(&self) -> impl Iterator<Item = (u8, &Region)> {
        self.sectors
            .iter()
            .flat_map(|s| s.data_blocks().map(move |b| (s.index, b)))
    }
}
