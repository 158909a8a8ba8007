//! MIFARE DESFire: applications (24-bit ids) holding up to 32 files each.
//!
//! The application directory can always be listed without authenticating, which makes the
//! list of application ids the cheap data for early checks.

use super::{Region, RegionKind, RegionState};
use crate::{Address, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MAX_FILES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Standard,
    Backup,
    Value,
    LinearRecord { record_size: usize },
    CyclicRecord { record_size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesfireFile {
    pub kind: FileKind,
    pub region: Region,
}

impl DesfireFile {
    pub fn new(id: u8, kind: FileKind, state: RegionState) -> Self {
        Self {
            kind,
            region: Region::new(id.into(), RegionKind::File, state),
        }
    }

    pub fn id(&self) -> u8 {
        self.region.index as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesfireApplication {
    pub id: u32,
    pub files: Vec<DesfireFile>,
}

impl DesfireApplication {
    pub fn file(&self, file: u8) -> Result<&DesfireFile> {
        self.files
            .iter()
            .find(|f| f.id() == file)
            .ok_or(Error::OutOfRange(Address::File { app: self.id, file }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesfireCard {
    pub applications: Vec<DesfireApplication>,
}

impl DesfireCard {
    /// Rejects ids that don't fit, and ids listed twice.
    pub fn new(applications: Vec<DesfireApplication>) -> Result<Self> {
        for (i, app) in applications.iter().enumerate() {
            if app.id > 0xFF_FFFF || applications[..i].iter().any(|a| a.id == app.id) {
                return Err(Error::OutOfRange(Address::Application(app.id)));
            }
            if app.files.len() > MAX_FILES {
                return Err(Error::OutOfRange(Address::Application(app.id)));
            }
            for (j, file) in app.files.iter().enumerate() {
                let duplicate = app.files[..j].iter().any(|f| f.id() == file.id());
                if duplicate || file.region.index as usize >= MAX_FILES {
                    return Err(Error::OutOfRange(Address::File {
                        app: app.id,
                        file: file.id(),
                    }));
                }
            }
        }
        Ok(Self { applications })
    }

    pub fn app_ids(&self) -> Vec<u32> {
        self.applications.iter().map(|a| a.id).collect()
    }

    pub fn has_app(&self, app: u32) -> bool {
        self.applications.iter().any(|a| a.id == app)
    }

    pub fn application(&self, app: u32) -> Result<&DesfireApplication> {
        self.applications
            .iter()
            .find(|a| a.id == app)
            .ok_or(Error::OutOfRange(Address::Application(app)))
    }

    pub fn file(&self, app: u32, file: u8) -> Result<&[u8]> {
        self.application(app)?
            .file(file)?
            .region
            .data(Address::File { app, file })
    }

    /// Splits a record file into its records. Other file kinds come back as one record.
    pub fn records(&self, app: u32, file: u8) -> Result<Vec<&[u8]>> {
        let f = self.application(app)?.file(file)?;
        let data = f.region.data(Address::File { app, file })?;
        Ok(match f.kind {
            FileKind::LinearRecord { record_size } | FileKind::CyclicRecord { record_size }
                if record_size > 0 =>
            {
                let records = data.chunks_exact(record_size);
                if !records.remainder().is_empty() {
                    warn!(
                        app = format!("{:06X}", app),
                        file,
                        record_size,
                        trailing = records.remainder().len(),
                        "Dropping partial record"
                    );
                }
                records.collect()
            }
            _ => vec![data],
        })
    }
}
