//! URI grammar parser and execution dispatch.
//!
//! ```text
//! path     := ['/'] selector [ '#' slice ]
//! selector := "id:" 32hexchars
//!           | segment ( ('/'|'+') segment )*
//! segment  := name | "tag:" tagstring
//! slice    := "time:" timestamp | "gen:" integer
//! ```

use crate::addr::U128;
use crate::cortex::{scan_slot, Anchor};
use crate::error::{HnError, HnResult};
use crate::hal::{DeviceHandle, Hal};
use crate::ids::ObjectId;
use crate::resonance::{generate_tag_mask, scan as resonance_scan, ResonanceQuery};
use crate::volume::Volume;

/// The parsed selector half of a URI.
pub enum Selector {
    Id(ObjectId),
    NameTags { name: Option<String>, tags: Option<u64> },
}

/// The parsed `#` slice half of a URI, if present.
pub enum Slice {
    Time(i64),
    Gen(u32),
}

pub struct ParsedUri {
    pub selector: Selector,
    pub slice: Option<Slice>,
}

/// Parse a URI path into its selector and optional slice
///. Pure parsing; does not touch storage.
pub fn parse(path: &str) -> HnResult<ParsedUri> {
    let path = path.strip_prefix('/').unwrap_or(path);

    let (selector_str, slice_str) = match path.split_once('#') {
        Some((s, rest)) => (s, Some(rest)),
        None => (path, None),
    };

    let selector = if let Some(hex) = selector_str.strip_prefix("id:") {
        parse_id(hex)?
    } else {
        parse_name_tags(selector_str)?
    };

    let slice = match slice_str {
        Some(s) => Some(parse_slice(s)?),
        None => None,
    };

    Ok(ParsedUri { selector, slice })
}

fn parse_id(hex: &str) -> HnResult<Selector> {
    if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HnError::InvalidArgument);
    }
    let value = u128::from_str_radix(hex, 16).map_err(|_| HnError::InvalidArgument)?;
    let u128_val = U128::from_parts(value as u64, (value >> 64) as u64);
    Ok(Selector::Id(ObjectId::from(u128_val)))
}

fn parse_name_tags(selector: &str) -> HnResult<Selector> {
    let mut tags: Option<u64> = None;
    let mut name: Option<String> = None;
    let mut tag_group = false;
    let mut token = String::new();

    let mut commit = |token: &str, tag_group: &mut bool, tags: &mut Option<u64>, name: &mut Option<String>| {
        if token.is_empty() {
            return;
        }
        if let Some(rest) = token.strip_prefix("tag:") {
            *tags = Some(tags.unwrap_or(0) | generate_tag_mask(rest));
            *tag_group = true;
        } else if *tag_group {
            *tags = Some(tags.unwrap_or(0) | generate_tag_mask(token));
        } else {
            *name = Some(token.to_string());
        }
    };

    for ch in selector.chars() {
        match ch {
            '/' => {
                commit(&token, &mut tag_group, &mut tags, &mut name);
                token.clear();
                tag_group = false;
            }
            '+' => {
                commit(&token, &mut tag_group, &mut tags, &mut name);
                token.clear();
            }
            _ => token.push(ch),
        }
    }
    commit(&token, &mut tag_group, &mut tags, &mut name);

    if name.is_none() && tags.is_none() {
        return Err(HnError::InvalidArgument);
    }

    Ok(Selector::NameTags { name, tags })
}

fn parse_slice(s: &str) -> HnResult<Slice> {
    if let Some(rest) = s.strip_prefix("time:") {
        if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            let ns: i64 = rest.parse().map_err(|_| HnError::InvalidArgument)?;
            return Ok(Slice::Time(ns));
        }
        return Ok(Slice::Time(parse_iso8601(rest)?));
    }
    if let Some(rest) = s.strip_prefix("gen:") {
        let gen: u32 = rest.parse().map_err(|_| HnError::InvalidArgument)?;
        return Ok(Slice::Gen(gen));
    }
    Err(HnError::InvalidArgument)
}

fn is_leap_year(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_month(y: i64, m: u32) -> u32 {
    match m {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(y) {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

/// Days since the Unix epoch for a calendar-valid Gregorian `(y, m, d)`,
/// using Howard Hinnant's `days_from_civil` algorithm.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Parse a calendar-validated Gregorian `YYYY-MM[-DD]` into epoch
/// nanoseconds at midnight UTC.
fn parse_iso8601(s: &str) -> HnResult<i64> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(HnError::InvalidArgument);
    }
    let year: i64 = parts[0].parse().map_err(|_| HnError::InvalidArgument)?;
    let month: u32 = parts[1].parse().map_err(|_| HnError::InvalidArgument)?;
    if !(1..=12).contains(&month) {
        return Err(HnError::InvalidArgument);
    }
    let day: u32 = if parts.len() == 3 {
        parts[2].parse().map_err(|_| HnError::InvalidArgument)?
    } else {
        1
    };
    if day == 0 || day > days_in_month(year, month) {
        return Err(HnError::InvalidArgument);
    }

    let days = days_from_civil(year, month as i64, day as i64);
    Ok(days * 86_400 * 1_000_000_000)
}

/// Execute a parsed URI against a mounted volume.
pub fn execute(
    vol: &Volume,
    hal: &dyn Hal,
    device: DeviceHandle,
    parsed: &ParsedUri,
) -> HnResult<Anchor> {
    let anchor = match &parsed.selector {
        Selector::Id(id) => scan_slot(vol, hal, device, *id)?.anchor,
        Selector::NameTags { name, tags } => {
            let name_bytes = name.as_ref().map(|n| n.as_bytes());
            let query = ResonanceQuery {
                required_tags: *tags,
                name: name_bytes,
                threshold_pct: 100,
            };
            resonance_scan(vol, hal, device, &query)?
        }
    };

    if let Some(slice) = &parsed.slice {
        apply_slice(&anchor, slice)?;
    }

    Ok(anchor)
}

fn apply_slice(anchor: &Anchor, slice: &Slice) -> HnResult<()> {
    match slice {
        Slice::Time(target_ns) => {
            let create_ns = anchor.create_clock as i64 * 1_000_000_000;
            let mod_ns = anchor.mod_clock as i64;
            if create_ns > *target_ns {
                return Err(HnError::NotFound);
            }
            if mod_ns > *target_ns {
                return Err(HnError::TimeParadox);
            }
            Ok(())
        }
        Slice::Gen(target_gen) => {
            if anchor.write_gen != *target_gen {
                return Err(HnError::TimeParadox);
            }
            Ok(())
        }
    }
}
