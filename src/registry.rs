//! Works out which scheme a card belongs to.
//!
//! Schemes are tried in a fixed order. Within a technology, more specific signatures come
//! before more generic ones, and the locked/blank catch-alls come last, so the first scheme
//! to accept a card is the right one.

use crate::card::Card;
use crate::scheme::{
    erg::Erg,
    ezlink::EzLink,
    fallback::{Blank, Locked},
    myki::Myki,
    nextfare,
    octopus::Octopus,
    opal::Opal,
    orca::Orca,
    shenzhen::Shenzhen,
    suica::Suica,
    Scheme,
};
use crate::transit::{TransitIdentity, TransitRecord};
use crate::{Error, Result};
use tracing::{debug, trace_span};

/// Every scheme, in the order they're tried.
pub static SCHEMES: &[&dyn Scheme] = &[
    // MIFARE Classic
    &Erg,
    &nextfare::SEQ_GO,
    &nextfare::LAX_TAP,
    &nextfare::NEXTFARE,
    &Locked::CLASSIC,
    &Blank::CLASSIC,
    // MIFARE DESFire
    &Opal,
    &Myki,
    &Orca,
    &Locked::DESFIRE,
    // MIFARE Ultralight
    &Locked::ULTRALIGHT,
    &Blank::ULTRALIGHT,
    // FeliCa
    &Suica,
    &Octopus::DUAL,
    &Octopus::OCTOPUS,
    &Octopus::SHENZHEN,
    &Locked::FELICA,
    // ISO 7816
    &Shenzhen,
    &Locked::ISO7816,
    // CEPAS
    &EzLink,
    &Locked::CEPAS,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    Known {
        tag: &'static str,
        identity: TransitIdentity,
    },
    /// Picked up by a catch-all for cards we have no keys for.
    Locked {
        tag: &'static str,
        identity: TransitIdentity,
    },
    Unknown,
}

impl Identification {
    fn new(scheme: &dyn Scheme, identity: TransitIdentity) -> Self {
        let tag = scheme.tag();
        if scheme.is_locked() {
            Self::Locked { tag, identity }
        } else {
            Self::Known { tag, identity }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known {
        tag: &'static str,
        record: TransitRecord,
    },
    Locked {
        tag: &'static str,
        record: TransitRecord,
    },
    Unknown,
}

impl Decoded {
    fn new(scheme: &dyn Scheme, record: TransitRecord) -> Self {
        let tag = scheme.tag();
        if scheme.is_locked() {
            Self::Locked { tag, record }
        } else {
            Self::Known { tag, record }
        }
    }

    pub fn record(&self) -> Option<&TransitRecord> {
        match self {
            Self::Known { record, .. } | Self::Locked { record, .. } => Some(record),
            Self::Unknown => None,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Registry {
    schemes: &'static [&'static dyn Scheme],
}

impl Default for Registry {
    fn default() -> Self {
        Self { schemes: SCHEMES }
    }
}

impl Registry {
    pub fn schemes(&self) -> impl Iterator<Item = &'static dyn Scheme> {
        self.schemes.iter().copied()
    }

    /// Looks up a scheme by its current tag or any tag it used to have.
    pub fn by_tag(&self, tag: &str) -> Result<&'static dyn Scheme> {
        self.schemes()
            .find(|s| s.tag() == tag || s.aliases().contains(&tag))
            .ok_or_else(|| Error::UnknownTag(tag.to_string()))
    }

    /// Schemes whose early check passes, in priority order.
    pub fn candidates(&self, card: &Card) -> Vec<&'static dyn Scheme> {
        let tech = card.technology();
        self.schemes()
            .filter(|s| s.technology() == tech && s.early_check(card))
            .collect()
    }

    /// The first candidate whose full check accepts the card.
    ///
    /// Declines (see [`Error::is_decline`]) move on to the next candidate; any other error
    /// means the card looked like ours but is broken, and is returned.
    pub fn find(&self, card: &Card) -> Result<Option<&'static dyn Scheme>> {
        let span = trace_span!("find", tech = ?card.technology());
        let _enter = span.enter();

        for scheme in self.candidates(card) {
            match scheme.check(card) {
                Ok(()) => {
                    debug!(tag = scheme.tag(), "Matched");
                    return Ok(Some(scheme));
                }
                Err(err) if err.is_decline() => {
                    debug!(tag = scheme.tag(), %err, "Declined");
                }
                Err(err) => return Err(err),
            }
        }
        debug!("No scheme matched");
        Ok(None)
    }

    pub fn identify(&self, card: &Card) -> Result<Identification> {
        let Some(scheme) = self.find(card)? else {
            return Ok(Identification::Unknown);
        };
        Ok(Identification::new(scheme, scheme.identify(card)?))
    }

    pub fn decode(&self, card: &Card) -> Result<Decoded> {
        let Some(scheme) = self.find(card)? else {
            return Ok(Decoded::Unknown);
        };
        Ok(Decoded::new(scheme, scheme.decode(card)?))
    }

    pub fn identify_as(&self, card: &Card, tag: &str) -> Result<Identification> {
        let scheme = self.by_tag(tag)?;
        Ok(Identification::new(scheme, scheme.identify(card)?))
    }

    /// Decodes with a named scheme, skipping dispatch. For dumps that recorded their scheme.
    pub fn decode_as(&self, card: &Card, tag: &str) -> Result<Decoded> {
        let scheme = self.by_tag(tag)?;
        debug!(tag, resolved = scheme.tag(), "Decoding with named scheme");
        Ok(Decoded::new(scheme, scheme.decode(card)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::classic::tests::card_with;
    use crate::card::felica::tests::felica_card;
    use crate::card::desfire::tests::desfire_card;
    use crate::card::{
        CepasCard, ClassicCard, ClassicSector, FileKind, Iso7816Application, Iso7816Card,
        Iso7816File, Media, Region, RegionKind, RegionState, Technology, UltralightCard,
    };
    use crate::scheme::orca::APP_ID as ORCA_APP_ID;
    use crate::scheme::nextfare::tests::nextfare_card;
    use crate::scheme::nextfare::SEQ_GO_SYSTEM_CODES;
    use crate::scheme::octopus::{SERVICE_OCTOPUS, SERVICE_SZT, SYSTEM_OCTOPUS, SYSTEM_SZT};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn wrap(media: Media) -> Card {
        Card::new(
            [0x04, 0x11, 0x22, 0x33],
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            media,
        )
    }

    #[test]
    fn test_tags() {
        let registry = Registry::default();
        let table: Vec<_> = registry
            .schemes()
            .map(|s| (s.tag(), s.aliases(), s.technology()))
            .collect();
        assert_eq!(
            table,
            vec![
                ("erg", &["erg.unknown"][..], Technology::Classic),
                ("nextfare.seq_go", &["seq_go"][..], Technology::Classic),
                ("nextfare.lax_tap", &["lax_tap"][..], Technology::Classic),
                ("nextfare", &["nextfare.unknown"][..], Technology::Classic),
                ("classic.locked", &["unauthorized_classic"][..], Technology::Classic),
                ("classic.blank", &[][..], Technology::Classic),
                ("opal", &[][..], Technology::Desfire),
                ("myki", &[][..], Technology::Desfire),
                ("orca", &[][..], Technology::Desfire),
                ("desfire.locked", &[][..], Technology::Desfire),
                ("ultralight.locked", &[][..], Technology::Ultralight),
                ("ultralight.blank", &[][..], Technology::Ultralight),
                ("suica", &[][..], Technology::Felica),
                ("octopus.dual", &["octopus_szt"][..], Technology::Felica),
                ("octopus", &[][..], Technology::Felica),
                ("szt.felica", &[][..], Technology::Felica),
                ("felica.locked", &[][..], Technology::Felica),
                ("szt", &["newshenzhen"][..], Technology::Iso7816),
                ("iso7816.locked", &[][..], Technology::Iso7816),
                ("ezlink", &["cepas"][..], Technology::Cepas),
                ("cepas.locked", &[][..], Technology::Cepas),
            ]
        );
    }

    #[test]
    fn test_by_tag() {
        let registry = Registry::default();
        assert_eq!(registry.by_tag("seq_go").unwrap().tag(), "nextfare.seq_go");
        assert_eq!(registry.by_tag("octopus_szt").unwrap().tag(), "octopus.dual");
        assert_eq!(registry.by_tag("orca").unwrap().tag(), "orca");
        assert!(matches!(
            registry.by_tag("clipper"),
            Err(Error::UnknownTag(tag)) if tag == "clipper"
        ));
        for scheme in registry.schemes() {
            assert_eq!(registry.by_tag(scheme.tag()).unwrap().tag(), scheme.tag());
            for alias in scheme.aliases() {
                assert_eq!(registry.by_tag(alias).unwrap().tag(), scheme.tag());
            }
        }
    }

    #[test]
    fn test_specific_before_generic() {
        let registry = Registry::default();
        let card = nextfare_card([0x15, 0xCD, 0x5B, 0x07], SEQ_GO_SYSTEM_CODES[0], [0; 16]);
        // Both match; the Go card signature is more specific.
        assert!(nextfare::NEXTFARE.check(&card).is_ok());
        assert!(matches!(
            registry.identify(&card).unwrap(),
            Identification::Known { tag: "nextfare.seq_go", .. }
        ));

        let mut block = vec![0; 16];
        block[..4].copy_from_slice(&1000u32.to_be_bytes());
        let card = felica_card(vec![
            (SYSTEM_SZT, vec![(SERVICE_SZT, vec![block.clone()])]),
            (SYSTEM_OCTOPUS, vec![(SERVICE_OCTOPUS, vec![block])]),
        ]);
        assert!(Octopus::OCTOPUS.check(&card).is_ok());
        let Decoded::Known { tag, record } = registry.decode(&card).unwrap() else {
            panic!("expected a known card");
        };
        assert_eq!(tag, "octopus.dual");
        assert_eq!(record.balances.len(), 2);
    }

    #[test]
    fn test_locked_and_unknown() {
        let registry = Registry::default();
        let card = wrap(Media::Classic(
            ClassicCard::new((0..16).map(ClassicSector::unauthorized).collect()).unwrap(),
        ));
        assert_eq!(
            registry.identify(&card).unwrap(),
            Identification::Locked {
                tag: "classic.locked",
                identity: TransitIdentity::new("Locked MIFARE Classic card", None),
            }
        );
        assert!(matches!(
            registry.decode(&card).unwrap(),
            Decoded::Locked { tag: "classic.locked", .. }
        ));

        let card = wrap(Media::Classic(card_with(&[])));
        assert!(matches!(
            registry.identify(&card).unwrap(),
            Identification::Known { tag: "classic.blank", .. }
        ));

        let mut used = [0u8; 16];
        used[0] = 0x42;
        let card = wrap(Media::Classic(card_with(&[(4, 1, used)])));
        assert_eq!(registry.identify(&card).unwrap(), Identification::Unknown);
        assert_eq!(registry.decode(&card).unwrap(), Decoded::Unknown);

        let card = felica_card(vec![(0xFE00, vec![])]);
        assert_eq!(registry.identify(&card).unwrap(), Identification::Unknown);
    }

    /// Marks every region on the card as one we had no key for.
    fn lock_all(card: &mut Card) {
        let regions: Vec<&mut Region> = match &mut card.media {
            Media::Classic(c) => c
                .sectors
                .iter_mut()
                .flat_map(|s| s.blocks.iter_mut())
                .collect(),
            Media::Desfire(d) => d
                .applications
                .iter_mut()
                .flat_map(|a| a.files.iter_mut())
                .map(|f| &mut f.region)
                .collect(),
            Media::Ultralight(u) => u.pages.iter_mut().skip(4).collect(),
            Media::Felica(f) => f
                .systems
                .iter_mut()
                .flat_map(|s| s.services.iter_mut())
                .flat_map(|s| s.blocks.iter_mut())
                .collect(),
            Media::Iso7816(i) => {
                for file in i.applications.iter_mut().flat_map(|a| a.files.iter_mut()) {
                    if file.binary.is_some() {
                        file.binary = Some(RegionState::Unauthorized);
                    }
                }
                i.applications
                    .iter_mut()
                    .flat_map(|a| {
                        a.files
                            .iter_mut()
                            .flat_map(|f| f.records.iter_mut())
                            .chain(a.balances.iter_mut())
                    })
                    .collect()
            }
            Media::Cepas(c) => c.purses.iter_mut().chain(c.histories.iter_mut()).collect(),
        };
        for r in regions {
            r.state = RegionState::Unauthorized;
        }
    }

    #[test]
    fn test_locked_content_cards() {
        let registry = Registry::default();

        // An ORCA application with every file behind a key.
        let files = (0..5).map(|id| (id, FileKind::Standard, vec![0; 48])).collect();
        let mut card = desfire_card(vec![(ORCA_APP_ID, files)]);
        lock_all(&mut card);
        assert!(matches!(
            registry.identify(&card).unwrap(),
            Identification::Locked { tag: "desfire.locked", .. }
        ));
        assert!(matches!(
            registry.decode(&card).unwrap(),
            Decoded::Locked { tag: "desfire.locked", .. }
        ));

        // A Suica system whose history we couldn't read.
        let mut card = felica_card(vec![(0x0003, vec![(0x090F, vec![vec![0; 16]; 4])])]);
        assert!(matches!(
            registry.identify(&card).unwrap(),
            Identification::Known { tag: "suica", .. }
        ));
        lock_all(&mut card);
        assert!(matches!(
            registry.identify(&card).unwrap(),
            Identification::Locked { tag: "felica.locked", .. }
        ));
        assert!(matches!(
            registry.decode(&card).unwrap(),
            Decoded::Locked { tag: "felica.locked", .. }
        ));
    }

    #[test]
    fn test_decode_as() {
        let registry = Registry::default();
        let card = wrap(Media::Ultralight(
            UltralightCard::from_pages(None, vec![Some([0; 4]); 16]).unwrap(),
        ));
        let Decoded::Known { tag, record } = registry.decode_as(&card, "ultralight.blank").unwrap()
        else {
            panic!("expected a known card");
        };
        assert_eq!(tag, "ultralight.blank");
        assert_eq!(record.card_name, "Blank MIFARE Ultralight card");
        assert!(matches!(
            registry.decode_as(&card, "ultralight.locked"),
            Err(Error::NotThisScheme)
        ));
    }

    fn arb_sector(index: u8) -> impl Strategy<Value = ClassicSector> {
        prop_oneof![
            Just(ClassicSector::unauthorized(index)),
            prop::collection::vec(
                prop_oneof![
                    Just(vec![0u8; 16]),
                    Just(vec![0xFFu8; 16]),
                    prop::collection::vec(any::<u8>(), 16),
                ],
                4
            )
            .prop_map(move |blocks| ClassicSector::new(index, blocks)),
        ]
    }

    fn arb_classic() -> impl Strategy<Value = Card> {
        (0..16u8)
            .map(arb_sector)
            .collect::<Vec<_>>()
            .prop_map(|sectors| wrap(Media::Classic(ClassicCard::new(sectors).unwrap())))
    }

    /// One card per technology, shaped like something a content scheme would claim.
    fn arb_lockable() -> impl Strategy<Value = Card> {
        prop_oneof![
            (1..=16u8).prop_map(|count| {
                let sectors = (0..count)
                    .map(|i| ClassicSector::new(i, vec![vec![0; 16]; 4]))
                    .collect();
                wrap(Media::Classic(ClassicCard::new(sectors).unwrap()))
            }),
            prop::collection::vec(any::<u8>(), 48).prop_map(|data| {
                let files = (0..5).map(|id| (id, FileKind::Standard, data.clone())).collect();
                desfire_card(vec![
                    (ORCA_APP_ID, files),
                    (0x31_4553, vec![(7, FileKind::Standard, data)]),
                ])
            }),
            (5..=45usize).prop_map(|count| wrap(Media::Ultralight(
                UltralightCard::from_pages(None, vec![Some([0x42; 4]); count]).unwrap()
            ))),
            (1..=8usize).prop_map(|count| felica_card(vec![
                (0x0003, vec![(0x090F, vec![vec![0; 16]; count])]),
                (SYSTEM_OCTOPUS, vec![(SERVICE_OCTOPUS, vec![vec![0; 16]])]),
            ])),
            prop::collection::vec(any::<u8>(), 1..=4).prop_map(|record| wrap(Media::Iso7816(
                Iso7816Card::new(vec![Iso7816Application {
                    name: b"PAY.SZT".to_vec(),
                    files: vec![
                        Iso7816File::binary(0x15, vec![0; 30]),
                        Iso7816File::with_records(0x18, vec![record]),
                    ],
                    balances: vec![Region::readable(0, RegionKind::Value, vec![0; 4])],
                }])
                .unwrap()
            ))),
            (0..16u8).prop_map(|purse| {
                let card = CepasCard::from_data(vec![(purse, vec![0; 32])], vec![(purse, vec![0; 16])]);
                wrap(Media::Cepas(card.unwrap()))
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_dispatch_picks_first_match(card in arb_classic()) {
            let registry = Registry::default();
            let found = registry.find(&card).unwrap().map(|s| s.tag());
            prop_assert_eq!(found, registry.find(&card).unwrap().map(|s| s.tag()));

            let first = registry
                .candidates(&card)
                .into_iter()
                .find(|s| s.check(&card).is_ok())
                .map(|s| s.tag());
            prop_assert_eq!(found, first);
        }

        #[test]
        fn prop_all_locked_is_locked(count in 1..=16u8) {
            let card = wrap(Media::Classic(
                ClassicCard::new((0..count).map(ClassicSector::unauthorized).collect()).unwrap(),
            ));
            let identified = Registry::default().identify(&card).unwrap();
            let is_locked = matches!(identified, Identification::Locked { .. });
            prop_assert!(is_locked);
        }

        #[test]
        fn prop_every_technology_locks(mut card in arb_lockable()) {
            lock_all(&mut card);
            let registry = Registry::default();
            let identified = registry.identify(&card).unwrap();
            let tag = match identified {
                Identification::Locked { tag, .. } => tag,
                other => panic!("{:?} wasn't locked: {:?}", card.technology(), other),
            };
            prop_assert_eq!(registry.by_tag(tag).unwrap().technology(), card.technology());
            let decoded = registry.decode(&card).unwrap();
            let decoded_locked = matches!(decoded, Decoded::Locked { .. });
            prop_assert!(decoded_locked);
        }
    }
}
