//! Saved card reads, so a card can be decoded again later without having it on hand.
//!
//! A dump is a JSON document with a format version, the card's tag id and scan time, and
//! exactly one technology-specific key holding the raw regions. Every region is stored as
//! `{"data": "<hex>"}`, `"unauthorized"` or `{"invalid": "<reason>"}`. If the dump also
//! names a scheme (by tag, old aliases included), that scheme is used instead of dispatch.

use crate::card::classic::{blocks_in_sector, MAX_SECTORS};
use crate::card::{
    Card, CepasCard, ClassicCard, ClassicSector, DesfireApplication, DesfireCard, DesfireFile,
    FelicaCard, FelicaService, FelicaSystem, FileKind, Iso7816Application, Iso7816Card,
    Iso7816File, Media, Region, RegionKind, RegionState, UltralightCard,
};
use crate::registry::{Decoded, Identification, Registry};
use crate::{Address, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace_span};

pub const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    pub version: u32,
    #[serde(with = "hex")]
    pub tag_id: Vec<u8>,
    pub scanned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(flatten)]
    pub media: MediaDump,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaDump {
    Classic(ClassicDump),
    Desfire(DesfireDump),
    Ultralight(UltralightDump),
    Felica(FelicaDump),
    Iso7816(Iso7816Dump),
    Cepas(CepasDump),
}

/// Sectors in order, each a list of its blocks in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicDump {
    pub sectors: Vec<Vec<RegionState>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesfireDump {
    pub applications: Vec<DesfireAppDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesfireAppDump {
    pub id: u32,
    pub files: Vec<DesfireFileDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesfireFileDump {
    pub id: u8,
    pub kind: FileKind,
    pub content: RegionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UltralightDump {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub pages: Vec<RegionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FelicaDump {
    pub idm: u64,
    pub systems: Vec<FelicaSystemDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FelicaSystemDump {
    pub code: u16,
    pub services: Vec<FelicaServiceDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FelicaServiceDump {
    pub code: u16,
    pub blocks: Vec<RegionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso7816Dump {
    pub applications: Vec<Iso7816AppDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso7816AppDump {
    #[serde(with = "hex")]
    pub name: Vec<u8>,
    pub files: Vec<Iso7816FileDump>,
    /// GET BALANCE results by purse index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub balances: Vec<RegionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iso7816FileDump {
    pub id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<RegionState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<RegionState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CepasDump {
    pub purses: Vec<CepasFileDump>,
    pub histories: Vec<CepasFileDump>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CepasFileDump {
    pub purse: u8,
    pub content: RegionState,
}

fn states(regions: &[Region]) -> Vec<RegionState> {
    regions.iter().map(|r| r.state.clone()).collect()
}

fn regions(states: &[RegionState], kind: RegionKind) -> Vec<Region> {
    states
        .iter()
        .enumerate()
        .map(|(i, s)| Region::new(i as u32, kind, s.clone()))
        .collect()
}

impl From<&Media> for MediaDump {
    fn from(media: &Media) -> Self {
        match media {
            Media::Classic(c) => Self::Classic(ClassicDump {
                sectors: c.sectors.iter().map(|s| states(&s.blocks)).collect(),
            }),
            Media::Desfire(c) => Self::Desfire(DesfireDump {
                applications: c
                    .applications
                    .iter()
                    .map(|a| DesfireAppDump {
                        id: a.id,
                        files: a
                            .files
                            .iter()
                            .map(|f| DesfireFileDump {
                                id: f.id(),
                                kind: f.kind,
                                content: f.region.state.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
            }),
            Media::Ultralight(c) => Self::Ultralight(UltralightDump {
                model: c.model.clone(),
                pages: states(&c.pages),
            }),
            Media::Felica(c) => Self::Felica(FelicaDump {
                idm: c.idm,
                systems: c
                    .systems
                    .iter()
                    .map(|sys| FelicaSystemDump {
                        code: sys.code,
                        services: sys
                            .services
                            .iter()
                            .map(|svc| FelicaServiceDump {
                                code: svc.code,
                                blocks: states(&svc.blocks),
                            })
                            .collect(),
                    })
                    .collect(),
            }),
            Media::Iso7816(c) => Self::Iso7816(Iso7816Dump {
                applications: c
                    .applications
                    .iter()
                    .map(|a| Iso7816AppDump {
                        name: a.name.clone(),
                        files: a
                            .files
                            .iter()
                            .map(|f| Iso7816FileDump {
                                id: f.id,
                                binary: f.binary.clone(),
                                records: states(&f.records),
                            })
                            .collect(),
                        balances: states(&a.balances),
                    })
                    .collect(),
            }),
            Media::Cepas(c) => {
                let files = |regions: &[Region]| {
                    regions
                        .iter()
                        .map(|r| CepasFileDump {
                            purse: r.index as u8,
                            content: r.state.clone(),
                        })
                        .collect()
                };
                Self::Cepas(CepasDump {
                    purses: files(&c.purses),
                    histories: files(&c.histories),
                })
            }
        }
    }
}

impl MediaDump {
    /// Rebuilds the card model, with all the usual validation.
    pub fn to_media(&self) -> Result<Media> {
        Ok(match self {
            Self::Classic(d) => {
                if d.sectors.len() > MAX_SECTORS {
                    return Err(Error::OutOfRange(Address::Sector(MAX_SECTORS as u8)));
                }
                let sectors = d
                    .sectors
                    .iter()
                    .enumerate()
                    .map(|(i, blocks)| {
                        let index = i as u8;
                        let last = blocks_in_sector(i) - 1;
                        ClassicSector {
                            index,
                            blocks: blocks
                                .iter()
                                .enumerate()
                                .map(|(b, state)| {
                                    Region::new(
                                        b as u32,
                                        ClassicSector::kind_of(index, b, last),
                                        state.clone(),
                                    )
                                })
                                .collect(),
                        }
                    })
                    .collect();
                Media::Classic(ClassicCard::new(sectors)?)
            }
            Self::Desfire(d) => Media::Desfire(DesfireCard::new(
                d.applications
                    .iter()
                    .map(|a| DesfireApplication {
                        id: a.id,
                        files: a
                            .files
                            .iter()
                            .map(|f| DesfireFile::new(f.id, f.kind, f.content.clone()))
                            .collect(),
                    })
                    .collect(),
            )?),
            Self::Ultralight(d) => Media::Ultralight(UltralightCard::new(
                d.model.clone(),
                regions(&d.pages, RegionKind::Page),
            )?),
            Self::Felica(d) => Media::Felica(FelicaCard::new(
                d.idm,
                d.systems
                    .iter()
                    .map(|sys| FelicaSystem {
                        code: sys.code,
                        services: sys
                            .services
                            .iter()
                            .map(|svc| FelicaService {
                                code: svc.code,
                                blocks: regions(&svc.blocks, RegionKind::Data),
                            })
                            .collect(),
                    })
                    .collect(),
            )?),
            Self::Iso7816(d) => Media::Iso7816(Iso7816Card::new(
                d.applications
                    .iter()
                    .map(|a| Iso7816Application {
                        name: a.name.clone(),
                        files: a
                            .files
                            .iter()
                            .map(|f| Iso7816File {
                                id: f.id,
                                binary: f.binary.clone(),
                                records: regions(&f.records, RegionKind::File),
                            })
                            .collect(),
                        balances: regions(&a.balances, RegionKind::Value),
                    })
                    .collect(),
            )?),
            Self::Cepas(d) => {
                let files = |files: &[CepasFileDump]| {
                    files
                        .iter()
                        .map(|f| Region::new(f.purse.into(), RegionKind::File, f.content.clone()))
                        .collect()
                };
                Media::Cepas(CepasCard::new(files(&d.purses), files(&d.histories))?)
            }
        })
    }
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

impl Dump {
    pub fn new(card: &Card, scheme: Option<&str>) -> Self {
        Self {
            version: VERSION,
            tag_id: card.tag_id.clone(),
            scanned_at: card.scanned_at,
            scheme: scheme.map(str::to_string),
            media: (&card.media).into(),
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let span = trace_span!("from_json");
        let _enter = span.enter();

        // Check the version before anything else, so a newer format gets a clear error.
        let header: Header = serde_json::from_str(s)?;
        if header.version != VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        let dump: Self = serde_json::from_str(s)?;
        debug!(scheme = ?dump.scheme, "Loaded dump");
        Ok(dump)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_card(&self) -> Result<Card> {
        Ok(Card::new(
            self.tag_id.clone(),
            self.scanned_at,
            self.media.to_media()?,
        ))
    }

    pub fn identify(&self, registry: &Registry) -> Result<Identification> {
        let card = self.to_card()?;
        match &self.scheme {
            Some(tag) => registry.identify_as(&card, tag),
            None => registry.identify(&card),
        }
    }

    pub fn decode(&self, registry: &Registry) -> Result<Decoded> {
        let card = self.to_card()?;
        match &self.scheme {
            Some(tag) => registry.decode_as(&card, tag),
            None => registry.decode(&card),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::classic::tests::card_with;
    use chrono::TimeZone;
    use serde_json::json;

    const OPAL: &str = r#"{
        "version": 1,
        "tag_id": "04123456789abc",
        "scanned_at": "2018-04-02T00:00:00Z",
        "desfire": {
            "applications": [
                {
                    "id": 3229011,
                    "files": [
                        {"id": 7, "kind": "standard", "content": {"data": "4e61bc004505409a0048dab00439efbe"}},
                        {"id": 1, "kind": {"cyclic_record": {"record_size": 16}}, "content": "unauthorized"}
                    ]
                }
            ]
        }
    }"#;

    #[test]
    fn test_region_json() {
        assert_eq!(
            serde_json::to_value(RegionState::Readable(vec![0xDE, 0xAD])).unwrap(),
            json!({"data": "dead"})
        );
        assert_eq!(
            serde_json::to_value(RegionState::Unauthorized).unwrap(),
            json!("unauthorized")
        );
        assert_eq!(
            serde_json::to_value(RegionState::Invalid("NAK".into())).unwrap(),
            json!({"invalid": "NAK"})
        );
    }

    #[test]
    fn test_load_opal() {
        let dump = Dump::from_json(OPAL).unwrap();
        assert_eq!(dump.tag_id, vec![0x04, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(dump.scanned_at, Utc.with_ymd_and_hms(2018, 4, 2, 0, 0, 0).unwrap());

        let card = dump.to_card().unwrap();
        let desfire = card.desfire().unwrap();
        assert_eq!(desfire.app_ids(), vec![0x314553]);
        assert!(matches!(
            desfire.file(0x314553, 1),
            Err(Error::AccessDenied(Address::File { app: 0x314553, file: 1 }))
        ));

        let Decoded::Known { tag, record } = dump.decode(&Registry::default()).unwrap() else {
            panic!("expected a known card");
        };
        assert_eq!(tag, "opal");
        assert_eq!(record.serial.as_deref(), Some("3085 2201 2345 6785"));
        assert_eq!(record.balance().unwrap().money.to_string(), "AUD 12.34");
    }

    #[test]
    fn test_classic_round_trip() {
        let mut sectors = card_with(&[(1, 0, [0x42; 16])]).sectors;
        sectors[2] = ClassicSector::unauthorized(2);
        let card = Card::new(
            [0xDE, 0xAD, 0xBE, 0xEF],
            Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap(),
            Media::Classic(ClassicCard::new(sectors).unwrap()),
        );
        let dump = Dump::new(&card, Some("classic.blank"));

        let value = serde_json::to_value(&dump).unwrap();
        assert_eq!(value["version"], json!(1));
        assert_eq!(value["tag_id"], json!("deadbeef"));
        assert_eq!(value["scheme"], json!("classic.blank"));
        assert_eq!(value["classic"]["sectors"][1][0], json!({"data": "42".repeat(16)}));
        assert_eq!(value["classic"]["sectors"][2][3], json!("unauthorized"));

        let loaded = Dump::from_json(&dump.to_json().unwrap()).unwrap();
        assert_eq!(loaded, dump);
        assert_eq!(loaded.to_card().unwrap(), card);
    }

    #[test]
    fn test_scheme_alias() {
        let mut sectors: Vec<_> = (0..16).map(ClassicSector::unauthorized).collect();
        sectors[0] = ClassicSector::new(0, vec![vec![0; 16]; 4]);
        let card = Card::new(
            [0x01, 0x02, 0x03, 0x04],
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Media::Classic(ClassicCard::new(sectors).unwrap()),
        );
        // Not every sector is locked, so dispatch alone wouldn't pick this.
        let registry = Registry::default();
        assert_eq!(registry.identify(&card).unwrap(), Identification::Unknown);

        let dump = Dump::new(&card, Some("unauthorized_classic"));
        assert!(matches!(
            dump.decode(&registry),
            Err(Error::NotThisScheme)
        ));

        let dump = Dump::new(&card, Some("nonsense"));
        assert!(matches!(dump.identify(&registry), Err(Error::UnknownTag(_))));
    }

    #[test]
    fn test_bad_documents() {
        let newer = OPAL.replace("\"version\": 1", "\"version\": 2");
        assert!(matches!(
            Dump::from_json(&newer),
            Err(Error::UnsupportedVersion(2))
        ));
        assert!(matches!(Dump::from_json("{}"), Err(Error::Dump(_))));

        let no_media = r#"{"version": 1, "tag_id": "01", "scanned_at": "2020-01-01T00:00:00Z"}"#;
        assert!(matches!(Dump::from_json(no_media), Err(Error::Dump(_))));

        let sparse = r#"{
            "version": 1, "tag_id": "01", "scanned_at": "2020-01-01T00:00:00Z",
            "cepas": {"purses": [{"purse": 16, "content": "unauthorized"}], "histories": []}
        }"#;
        let dump = Dump::from_json(sparse).unwrap();
        assert!(matches!(
            dump.to_card(),
            Err(Error::OutOfRange(Address::Purse(16)))
        ));
    }
}
