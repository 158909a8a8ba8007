//! FeliCa: a card holds one or more Systems (virtual cards, each with its own 16-bit system
//! code), which hold Services, which hold 16-byte blocks.
//!
//! Listing system codes needs no keys, so that's what early checks look at.

use super::{check_dense, Region};
use crate::{Address, Error, Result};

pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FelicaService {
    pub code: u16,
    pub blocks: Vec<Region>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FelicaSystem {
    pub code: u16,
    pub services: Vec<FelicaService>,
}

impl FelicaSystem {
    pub fn service(&self, service: u16) -> Result<&FelicaService> {
        self.services
            .iter()
            .find(|s| s.code == service)
            .ok_or(Error::OutOfRange(Address::Service {
                system: self.code,
                service,
            }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FelicaCard {
    pub idm: u64,
    pub systems: Vec<FelicaSystem>,
}

impl FelicaCard {
    /// Rejects blocks out of order, and system or service codes listed twice.
    pub fn new(idm: u64, systems: Vec<FelicaSystem>) -> Result<Self> {
        for (i, system) in systems.iter().enumerate() {
            if systems[..i].iter().any(|s| s.code == system.code) {
                return Err(Error::OutOfRange(Address::System(system.code)));
            }
            for (j, service) in system.services.iter().enumerate() {
                if system.services[..j].iter().any(|s| s.code == service.code) {
                    return Err(Error::OutOfRange(Address::Service {
                        system: system.code,
                        service: service.code,
                    }));
                }
                check_dense(&service.blocks, |block| Address::FelicaBlock {
                    system: system.code,
                    service: service.code,
                    block: block as u16,
                })?;
            }
        }
        Ok(Self { idm, systems })
    }

    pub fn system_codes(&self) -> Vec<u16> {
        self.systems.iter().map(|s| s.code).collect()
    }

    pub fn has_system(&self, system: u16) -> bool {
        self.systems.iter().any(|s| s.code == system)
    }

    pub fn system(&self, system: u16) -> Result<&FelicaSystem> {
        self.systems
            .iter()
            .find(|s| s.code == system)
            .ok_or(Error::OutOfRange(Address::System(system)))
    }

    pub fn block(&self, system: u16, service: u16, block: u16) -> Result<&[u8]> {
        let at = Address::FelicaBlock {
            system,
            service,
            block,
        };
        self.system(system)?
            .service(service)?
            .blocks
            .get(block as usize)
            .ok_or(Error::OutOfRange(at))?
            .data(at)
    }

    /// All blocks of a service, in order. Fails on the first block that can't be read.
    pub fn blocks(&self, system: u16, service: u16) -> Result<Vec<&[u8]>> {
        self.system(system)?
            .service(service)?
            .blocks
            .iter()
            .map(|b| {
                b.data(Address::FelicaBlock {
                    system,
                    service,
                    block: b.index as u16,
                })
            })
            .collect()
    }
}
