//! Card schemes: one decoder per issuer format.
//!
//! Every scheme gets two chances to turn a card down. [`Scheme::early_check`] only looks at
//! data readable without keys (the manufacturer sector, DESFire application list, FeliCa
//! system codes, ISO 7816 application names), so it can run before the reader has spent any
//! time on authentication. [`Scheme::check`] then looks at whatever it needs to be sure.

pub mod erg;
pub mod ezlink;
pub mod fallback;
pub mod myki;
pub mod nextfare;
pub mod octopus;
pub mod opal;
pub mod orca;
pub mod shenzhen;
pub mod suica;

use crate::card::{
    Card, CepasCard, ClassicCard, DesfireCard, FelicaCard, Iso7816Card, Technology,
    UltralightCard,
};
use crate::transit::{Timestamp, TransitIdentity, TransitRecord};
use crate::{Error, Result};
use chrono::{Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};

pub trait Scheme: Sync {
    /// Stable identifier, stored alongside dumps so they can be re-decoded later.
    fn tag(&self) -> &'static str;

    /// Tags this scheme used to go by. Never remove anything from here.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn name(&self) -> &'static str;
    fn technology(&self) -> Technology;

    /// Cheap signature check over always-readable data.
    fn early_check(&self, card: &Card) -> bool;

    /// Full signature check. A declining error (see [`Error::is_decline`]) means "not mine";
    /// anything else means the card is ours but broken.
    fn check(&self, card: &Card) -> Result<()>;

    fn identify(&self, card: &Card) -> Result<TransitIdentity>;
    fn decode(&self, card: &Card) -> Result<TransitRecord>;

    /// Catch-alls that recognise a card as unreadable rather than as any particular scheme.
    fn is_locked(&self) -> bool {
        false
    }
}

pub(crate) fn ensure(cond: bool) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::NotThisScheme)
    }
}

pub(crate) fn classic(card: &Card) -> Result<&ClassicCard> {
    card.classic().ok_or(Error::NotThisScheme)
}

pub(crate) fn desfire(card: &Card) -> Result<&DesfireCard> {
    card.desfire().ok_or(Error::NotThisScheme)
}

pub(crate) fn ultralight(card: &Card) -> Result<&UltralightCard> {
    card.ultralight().ok_or(Error::NotThisScheme)
}

pub(crate) fn felica(card: &Card) -> Result<&FelicaCard> {
    card.felica().ok_or(Error::NotThisScheme)
}

pub(crate) fn iso7816(card: &Card) -> Result<&Iso7816Card> {
    card.iso7816().ok_or(Error::NotThisScheme)
}

pub(crate) fn cepas(card: &Card) -> Result<&CepasCard> {
    card.cepas().ok_or(Error::NotThisScheme)
}

/// A fixed UTC offset in whole hours. Schemes store local time; DST isn't modelled.
pub(crate) fn zone(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours * 3600).unwrap_or(Utc.fix())
}

/// Builds a local timestamp, failing on dates that don't exist.
pub(crate) fn local(
    tz: FixedOffset,
    (year, month, day): (i32, u32, u32),
    (hour, minute, second): (u32, u32, u32),
) -> Result<Timestamp> {
    tz.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| {
            Error::Corrupt(format!(
                "invalid timestamp {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ))
        })
}

/// Local midnight of `epoch` plus a number of days and seconds.
pub(crate) fn since_epoch(
    tz: FixedOffset,
    (year, month, day): (i32, u32, u32),
    days: i64,
    seconds: i64,
) -> Result<Timestamp> {
    let epoch = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| Error::Corrupt(format!("invalid epoch {}-{}-{}", year, month, day)))?;
    let naive = epoch + Duration::days(days) + Duration::seconds(seconds);
    tz.from_local_datetime(&naive)
        .single()
        .ok_or_else(|| Error::Corrupt(format!("invalid timestamp {}", naive)))
}
