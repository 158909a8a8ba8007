//! Zones travelled between two stops, for zone-fare systems (SEQ Translink).
//!
//! Stops on a zone boundary belong to several zones, written `2/3`. The special zone
//! `airtrain` covers the airport line, which sits "below" zone 1.

use crate::{Error, Result};
use std::cmp::Ordering;
use tracing::debug;

pub const AIRTRAIN: &str = "airtrain";
pub const AIRTRAIN_XFER: &str = "airtrain_xfer";
pub const MAX_ZONE: u32 = 23;

fn parse_set(label: &str) -> Result<Vec<String>> {
    let mut zones: Vec<String> = label
        .split('/')
        .map(|z| z.trim().to_ascii_lowercase())
        .collect();
    for z in &zones {
        if z == AIRTRAIN {
            continue;
        }
        match z.parse::<u32>() {
            Ok(n) if (1..=MAX_ZONE).contains(&n) => {}
            _ => return Err(Error::UnsupportedZone(z.clone())),
        }
    }
    // Numbers ascending, anything else after them.
    zones.sort_by(|a, b| match (a.parse::<u32>(), b.parse::<u32>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    Ok(zones)
}

/// Every zone transited between `start` and `end`, ascending.
///
/// `airtrain_exempt` is set for stations between South Brisbane and Eagle Junction, where
/// an AirTrain trip doesn't also pay for the suburban zones.
pub fn zones(start: &str, end: &str, airtrain_exempt: bool) -> Result<Vec<String>> {
    let mut starts = parse_set(start)?;
    let mut ends = parse_set(end)?;

    if let Some(shared) = starts.iter().find(|z| ends.contains(z)) {
        debug!(start, end, zone = %shared, "single zone trip");
        if shared == AIRTRAIN {
            return Ok(vec![AIRTRAIN_XFER.to_string()]);
        }
        return Ok(vec![shared.clone()]);
    }

    let highest = |v: &[String]| v.last().and_then(|z| z.parse::<u32>().ok());
    let lowest = |v: &[String]| v.first().and_then(|z| z.parse::<u32>().ok());

    // Special zones always go first; a special start is never swapped away.
    let swap = match (highest(&starts), lowest(&ends)) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(s), Some(e)) => s > e,
    };
    if swap {
        std::mem::swap(&mut starts, &mut ends);
    }

    let high_start = starts.last().map(String::as_str).unwrap_or_default();
    let low_end = lowest(&ends);
    if high_start == AIRTRAIN {
        let mut out = vec![AIRTRAIN.to_string()];
        if !airtrain_exempt {
            out.extend((1..=low_end.unwrap_or(0)).map(|z| z.to_string()));
        }
        return Ok(out);
    }
    match (highest(&starts), low_end) {
        (Some(s), Some(e)) if s > 0 && e > 0 => Ok((s..=e).map(|z| z.to_string()).collect()),
        _ => {
            debug!(start, end, "can't work out zones travelled");
            Err(Error::IndeterminateZones)
        }
    }
}

/// Like [`zones`], but just gives up on anything it doesn't understand.
pub fn zone_span(start: &str, end: &str, airtrain_exempt: bool) -> Option<Vec<String>> {
    zones(start, end, airtrain_exempt).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn z(start: &str, end: &str) -> Vec<String> {
        zones(start, end, false).unwrap()
    }

    #[test]
    fn test_one_zone() {
        assert_eq!(z("2", "2"), vec!["2"]);
        assert_eq!(z("2", "2/3"), vec!["2"]);
        assert_eq!(z("1/2", "2/3"), vec!["2"]);
        assert_eq!(z("2/1", "3/2"), vec!["2"]);
    }

    #[test]
    fn test_multi_zone() {
        assert_eq!(z("1", "2"), vec!["1", "2"]);
        assert_eq!(z("2", "1"), vec!["1", "2"]);
        assert_eq!(z("1/2", "4/5"), vec!["2", "3", "4"]);
        let long = z("1", "10");
        assert_eq!(long.len(), 10);
        assert_eq!(long.first().map(String::as_str), Some("1"));
        assert_eq!(long.last().map(String::as_str), Some("10"));
    }

    #[test]
    fn test_airtrain() {
        assert_eq!(z("1", "airtrain"), vec!["airtrain", "1"]);
        assert_eq!(z("airtrain", "airtrain"), vec!["airtrain_xfer"]);
        assert_eq!(z("3", "airtrain"), vec!["airtrain", "1", "2", "3"]);
        assert_eq!(z("AirTrain", "2"), vec!["airtrain", "1", "2"]);
        assert_eq!(zones("1", "airtrain", true).unwrap(), vec!["airtrain"]);
    }

    #[test]
    fn test_unsupported() {
        assert!(matches!(zones("0", "2", false), Err(Error::UnsupportedZone(z)) if z == "0"));
        assert!(matches!(zones("2", "24", false), Err(Error::UnsupportedZone(_))));
        assert!(matches!(zones("cairns", "2", false), Err(Error::UnsupportedZone(_))));
        assert_eq!(zone_span("", "2", false), None);
    }
}
