//! Catch-alls for cards we can't get anything out of: locked ones and factory-blank ones.
//!
//! These go after every content scheme of the same technology, so that a card with just
//! enough readable data for a real scheme never ends up here.

use super::{cepas, classic, desfire, ensure, felica, iso7816, ultralight, Scheme};
use crate::card::{
    Card, CepasCard, ClassicCard, DesfireCard, FelicaCard, Iso7816Card, Region, RegionKind,
    RegionState, Technology, UltralightCard,
};
use crate::codec;
use crate::transit::{TransitIdentity, TransitRecord};
use crate::Result;
use tracing::debug;

/// User memory on Ultralight and NTAG starts here; below is the UID, lock bytes and OTP.
const FIRST_USER_PAGE: usize = 4;

/// NTAG21x keep their configuration in the last few pages.
const NTAG_CONFIG_PAGES: usize = 5;

fn is_locked_classic(card: &ClassicCard) -> bool {
    !card.sectors.is_empty() && card.sectors.iter().all(|s| s.is_unauthorized())
}

fn is_blank_classic(card: &ClassicCard) -> bool {
    !card.sectors.is_empty()
        && card
            .sectors
            .iter()
            .all(|s| s.blocks.iter().all(Region::is_readable))
        && card
            .data_blocks()
            .filter(|(_, b)| b.kind != RegionKind::Manufacturer)
            .all(|(sector, b)| {
                let Some(data) = b.readable_data() else {
                    return false;
                };
                let blank = codec::is_filled(data, 0x00) || codec::is_filled(data, 0xFF);
                if !blank {
                    debug!(sector, block = b.index, "Not blank");
                }
                blank
            })
}

fn is_locked_desfire(card: &DesfireCard) -> bool {
    !card.applications.is_empty()
        && card
            .applications
            .iter()
            .flat_map(|a| a.files.iter())
            .all(|f| !f.region.is_readable())
}

/// Something to read, and none of it readable.
fn all_locked<'a>(states: impl IntoIterator<Item = &'a RegionState>) -> bool {
    let mut any = false;
    for state in states {
        if matches!(state, RegionState::Readable(_)) {
            return false;
        }
        any = true;
    }
    any
}

fn is_locked_felica(card: &FelicaCard) -> bool {
    all_locked(
        card.systems
            .iter()
            .flat_map(|sys| sys.services.iter())
            .flat_map(|svc| svc.blocks.iter())
            .map(|b| &b.state),
    )
}

fn is_locked_iso7816(card: &Iso7816Card) -> bool {
    all_locked(card.applications.iter().flat_map(|app| {
        app.files
            .iter()
            .flat_map(|f| f.binary.iter().chain(f.records.iter().map(|r| &r.state)))
            .chain(app.balances.iter().map(|b| &b.state))
    }))
}

fn is_locked_cepas(card: &CepasCard) -> bool {
    all_locked(card.purses.iter().chain(&card.histories).map(|r| &r.state))
}

fn user_pages(card: &UltralightCard) -> &[Region] {
    card.pages.get(FIRST_USER_PAGE..).unwrap_or_default()
}

fn is_locked_ultralight(card: &UltralightCard) -> bool {
    let pages = user_pages(card);
    !pages.is_empty() && pages.iter().all(Region::is_unauthorized)
}

/// Data a blank tag may carry from the factory: an empty NDEF message on NTAG, and the
/// configuration pages of the 20-page EV1.
fn is_factory_page(model: &str, count: usize, page: usize, data: &[u8]) -> bool {
    if model.starts_with("NTAG21") {
        if page + NTAG_CONFIG_PAGES >= count {
            return true;
        }
        return match (model, page) {
            ("NTAG213", 4) => data == [0x01, 0x03, 0xA0, 0x0C],
            ("NTAG213", 5) => data == [0x34, 0x03, 0x00, 0xFE],
            ("NTAG215" | "NTAG216", 4) => data == [0x03, 0x00, 0xFE, 0x00],
            _ => false,
        };
    }
    match (count, page) {
        (0x14, 0x10) => data == [0x00, 0x00, 0x00, 0xFF],
        (0x14, 0x11) => data == [0x00, 0x05, 0x00, 0x00],
        _ => false,
    }
}

fn is_blank_ultralight(card: &UltralightCard) -> bool {
    let count = card.pages.len();
    let pages = user_pages(card);
    !pages.is_empty()
        && pages.iter().all(|p| match p.readable_data() {
            Some(data) => {
                codec::is_filled(data, 0)
                    || is_factory_page(card.model(), count, p.index as usize, data)
            }
            None => false,
        })
}

/// A card with nothing we can read.
pub struct Locked(pub Technology);

impl Locked {
    pub const CLASSIC: Self = Self(Technology::Classic);
    pub const DESFIRE: Self = Self(Technology::Desfire);
    pub const ULTRALIGHT: Self = Self(Technology::Ultralight);
    pub const FELICA: Self = Self(Technology::Felica);
    pub const ISO7816: Self = Self(Technology::Iso7816);
    pub const CEPAS: Self = Self(Technology::Cepas);
}

impl Scheme for Locked {
    fn tag(&self) -> &'static str {
        match self.0 {
            Technology::Classic => "classic.locked",
            Technology::Desfire => "desfire.locked",
            Technology::Ultralight => "ultralight.locked",
            Technology::Felica => "felica.locked",
            Technology::Iso7816 => "iso7816.locked",
            Technology::Cepas => "cepas.locked",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self.0 {
            Technology::Classic => &["unauthorized_classic"],
            _ => &[],
        }
    }

    fn name(&self) -> &'static str {
        match self.0 {
            Technology::Classic => "Locked MIFARE Classic card",
            Technology::Desfire => "Locked MIFARE DESFire card",
            Technology::Ultralight => "Locked MIFARE Ultralight card",
            Technology::Felica => "Locked FeliCa card",
            Technology::Iso7816 => "Locked ISO 7816 card",
            Technology::Cepas => "Locked CEPAS card",
        }
    }

    fn technology(&self) -> Technology {
        self.0
    }

    fn early_check(&self, card: &Card) -> bool {
        card.technology() == self.0
    }

    fn check(&self, card: &Card) -> Result<()> {
        ensure(match self.0 {
            Technology::Classic => is_locked_classic(classic(card)?),
            Technology::Desfire => is_locked_desfire(desfire(card)?),
            Technology::Ultralight => is_locked_ultralight(ultralight(card)?),
            Technology::Felica => is_locked_felica(felica(card)?),
            Technology::Iso7816 => is_locked_iso7816(iso7816(card)?),
            Technology::Cepas => is_locked_cepas(cepas(card)?),
        })
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        self.check(card)?;
        Ok(TransitIdentity::new(self.name(), None))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        self.check(card)?;
        Ok(TransitRecord::new(self.name(), None)
            .with_info("Note", "None of the keys we have opened this card"))
    }

    fn is_locked(&self) -> bool {
        true
    }
}

/// A card that's readable but has never been written to.
pub struct Blank(pub Technology);

impl Blank {
    pub const CLASSIC: Self = Self(Technology::Classic);
    pub const ULTRALIGHT: Self = Self(Technology::Ultralight);
}

impl Scheme for Blank {
    fn tag(&self) -> &'static str {
        match self.0 {
            Technology::Classic => "classic.blank",
            _ => "ultralight.blank",
        }
    }

    fn name(&self) -> &'static str {
        match self.0 {
            Technology::Classic => "Blank MIFARE Classic card",
            _ => "Blank MIFARE Ultralight card",
        }
    }

    fn technology(&self) -> Technology {
        self.0
    }

    fn early_check(&self, card: &Card) -> bool {
        card.technology() == self.0
    }

    fn check(&self, card: &Card) -> Result<()> {
        ensure(match self.0 {
            Technology::Classic => is_blank_classic(classic(card)?),
            Technology::Ultralight => is_blank_ultralight(ultralight(card)?),
            _ => false,
        })
    }

    fn identify(&self, card: &Card) -> Result<TransitIdentity> {
        self.check(card)?;
        Ok(TransitIdentity::new(self.name(), None))
    }

    fn decode(&self, card: &Card) -> Result<TransitRecord> {
        self.check(card)?;
        Ok(TransitRecord::new(self.name(), None))
    }
}
