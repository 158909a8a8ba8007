//! ISO 7816-4 applications, as found on Chinese transit cards among others.
//!
//! Applications are selected by DF name. Files are addressed by 16-bit id and can hold
//! binary contents, records, or both. Balances come from a proprietary GET BALANCE command
//! and are kept separately per purse index.

use super::{check_dense, Region, RegionKind, RegionState};
use crate::{Address, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso7816File {
    pub id: u16,
    /// READ BINARY result, if the file has binary contents.
    pub binary: Option<RegionState>,
    /// READ RECORD results; index 0 is record 1.
    pub records: Vec<Region>,
}

impl Iso7816File {
    pub fn binary(id: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            binary: Some(RegionState::Readable(data.into())),
            records: vec![],
        }
    }

    pub fn with_records(id: u16, records: Vec<Vec<u8>>) -> Self {
        Self {
            id,
            binary: None,
            records: records
                .into_iter()
                .enumerate()
                .map(|(i, r)| Region::readable(i as u32, RegionKind::File, r))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso7816Application {
    pub name: Vec<u8>,
    pub files: Vec<Iso7816File>,
    pub balances: Vec<Region>,
}

impl Iso7816Application {
    pub fn file(&self, id: u16) -> Result<&Iso7816File> {
        self.files
            .iter()
            .find(|f| f.id == id)
            .ok_or(Error::OutOfRange(Address::Iso7816File { file: id }))
    }

    pub fn binary(&self, id: u16) -> Result<&[u8]> {
        let at = Address::Iso7816File { file: id };
        match &self.file(id)?.binary {
            Some(RegionState::Readable(data)) => Ok(data),
            Some(RegionState::Unauthorized) => Err(Error::AccessDenied(at)),
            Some(RegionState::Invalid(reason)) => {
                Err(Error::Corrupt(format!("{}: {}", at, reason)))
            }
            None => Err(Error::OutOfRange(at)),
        }
    }

    /// Every readable record of a file; locked or broken records are skipped.
    pub fn records(&self, id: u16) -> Result<Vec<&[u8]>> {
        Ok(self
            .file(id)?
            .records
            .iter()
            .filter_map(|r| {
                r.data(Address::Iso7816Record {
                    file: id,
                    record: r.index as u16 + 1,
                })
                .ok()
            })
            .collect())
    }

    pub fn balance(&self, idx: u8) -> Result<&[u8]> {
        let at = Address::Balance(idx);
        self.balances
            .get(idx as usize)
            .ok_or(Error::OutOfRange(at))?
            .data(at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iso7816Card {
    pub applications: Vec<Iso7816Application>,
}

impl Iso7816Card {
    pub fn new(applications: Vec<Iso7816Application>) -> Result<Self> {
        for app in &applications {
            check_dense(&app.balances, |i| Address::Balance(i as u8))?;
            for file in &app.files {
                check_dense(&file.records, |i| Address::Iso7816Record {
                    file: file.id,
                    record: i as u16 + 1,
                })?;
            }
        }
        Ok(Self { applications })
    }

    pub fn app_names(&self) -> Vec<&[u8]> {
        self.applications.iter().map(|a| a.name.as_slice()).collect()
    }

    pub fn application(&self, name: &[u8]) -> Option<&Iso7816Application> {
        self.applications.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_lookup() {
        let card = Iso7816Card::new(vec![Iso7816Application {
            name: b"PAY.SZT".to_vec(),
            files: vec![
                Iso7816File::binary(0x15, [0x01; 32]),
                Iso7816File::with_records(0x18, vec![vec![0; 23], vec![1; 23]]),
            ],
            balances: vec![Region::readable(0, RegionKind::Value, [0, 0, 0x04, 0xD2])],
        }])
        .unwrap();

        let app = card.application(b"PAY.SZT").unwrap();
        assert_eq!(app.binary(0x15).unwrap().len(), 32);
        assert_eq!(app.records(0x18).unwrap().len(), 2);
        assert!(matches!(app.binary(0x18), Err(Error::OutOfRange(_))));
        assert_eq!(app.balance(0).unwrap(), &[0, 0, 0x04, 0xD2]);
        assert!(card.application(b"PAY.APP").is_none());
    }
}
