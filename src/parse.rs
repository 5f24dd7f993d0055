//! Pure decoders for Sonicare characteristic payloads.
//!
//! All functions here are side-effect-free and total: unknown codes decode to
//! synthetic `unknown …` labels, out-of-range timestamps fall back to the raw
//! integer, and the brush-head percentage guards its division. Nothing in this
//! module performs I/O, so everything is safe to call from any context and
//! trivial to test.
//!
//! | Function | Payload | Produces |
//! |---|---|---|
//! | [`read_uint_le`] | any length | little-endian unsigned integer |
//! | [`decode_text`] | any length | trimmed UTF-8 string |
//! | [`decode_state`] | first byte | state name or `unknown state {byte}` |
//! | [`lookup_mode`] | decoded code | mode name for a model's table |
//! | [`lookup_strength`] | decoded code | intensity name |
//! | [`format_epoch`] | decoded seconds | local `YYYY-MM-DD HH:MM:SS` |
//! | [`remaining_life_percent`] | two counters | rounded remaining-life % |
//! | [`short_address`] | address string | 4-char device name suffix |

use chrono::{Local, TimeZone};

use crate::protocol::{STATES, STRENGTH};
use crate::types::Model;

// ── Integers ──────────────────────────────────────────────────────────────────

/// Interpret a payload as a little-endian unsigned integer.
///
/// The handles are inconsistent about payload widths (the same logical
/// counter can arrive as 2, 4, or 8 bytes depending on firmware), so this
/// accepts any length. Only the low 8 bytes contribute; an empty payload
/// reads as 0.
///
/// ```
/// # use sonicare_ble::parse::read_uint_le;
/// assert_eq!(read_uint_le(&[0x39, 0x05]), 1337);
/// assert_eq!(read_uint_le(&[]), 0);
/// ```
pub fn read_uint_le(data: &[u8]) -> u64 {
    data.iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)))
}

// ── Text ──────────────────────────────────────────────────────────────────────

/// Interpret a payload as text, dropping NUL padding and surrounding
/// whitespace.
///
/// The retail model string arrives as a fixed-width field padded with NUL
/// bytes; non-UTF-8 bytes are replaced rather than failing the read.
///
/// ```
/// # use sonicare_ble::parse::decode_text;
/// assert_eq!(decode_text(b"HX9924/01\0\0\0"), "HX9924/01");
/// assert_eq!(decode_text(b"\0\0"), "");
/// ```
pub fn decode_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_owned()
}

// ── State ─────────────────────────────────────────────────────────────────────

/// Table lookup for a handle state byte.
pub fn lookup_state(code: u8) -> Option<&'static str> {
    STATES
        .iter()
        .find(|&&(c, _)| c == code)
        .map(|&(_, name)| name)
}

/// Decode a handle state byte to its name, falling back to a synthetic
/// `unknown state {byte}` label so new firmware states never fail a poll.
///
/// ```
/// # use sonicare_ble::parse::decode_state;
/// assert_eq!(decode_state(2), "run");
/// assert_eq!(decode_state(9), "unknown state 9");
/// ```
pub fn decode_state(code: u8) -> String {
    match lookup_state(code) {
        Some(name) => name.to_owned(),
        None => format!("unknown state {code}"),
    }
}

// ── Mode and strength ─────────────────────────────────────────────────────────

/// Table lookup for a cleaning-mode code against `model`'s mode table.
///
/// Callers choose the fallback: the poll path reports `unknown mode {code}`,
/// the notification path just `unknown mode`.
pub fn lookup_mode(model: Model, code: u64) -> Option<&'static str> {
    model
        .description()
        .modes
        .iter()
        .find(|&&(c, _)| c == code)
        .map(|&(_, name)| name)
}

/// Table lookup for an intensity code. Fallback handling mirrors
/// [`lookup_mode`]: the poll path reports `unknown speed {code}`, the
/// notification path just `unknown speed`.
pub fn lookup_strength(code: u64) -> Option<&'static str> {
    STRENGTH
        .iter()
        .find(|&&(c, _)| c == code)
        .map(|&(_, name)| name)
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Render the handle's clock (Unix epoch seconds) as a local timestamp.
///
/// Falls back to the raw integer string when the value does not map to a
/// representable local time, which a confused or factory-fresh handle clock
/// can produce.
pub fn format_epoch(epoch: u64) -> String {
    i64::try_from(epoch)
        .ok()
        .and_then(|secs| Local.timestamp_opt(secs, 0).earliest())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

// ── Brush head ────────────────────────────────────────────────────────────────

/// Remaining brush-head life as a rounded percentage.
///
/// Both counters come straight off the wire; if either is zero the handle has
/// not populated them yet and the result is 0 rather than a division error or
/// a misleading 100 %.
///
/// ```
/// # use sonicare_ble::parse::remaining_life_percent;
/// assert_eq!(remaining_life_percent(10_000, 2_500), 75);
/// assert_eq!(remaining_life_percent(0, 2_500), 0);
/// assert_eq!(remaining_life_percent(10_000, 0), 0);
/// ```
pub fn remaining_life_percent(lifetime: u64, usage: u64) -> i64 {
    if lifetime != 0 && usage != 0 {
        (((lifetime as f64 - usage as f64) / lifetime as f64) * 100.0).round() as i64
    } else {
        0
    }
}

// ── Naming ────────────────────────────────────────────────────────────────────

/// Shorten a Bluetooth address to the 4-character suffix used in display
/// names.
///
/// The last two address groups are uppercased, joined, and trimmed to the
/// final four characters. Both `:` and `-` separators are accepted.
///
/// ```
/// # use sonicare_ble::parse::short_address;
/// assert_eq!(short_address("aa:bb:cc:dd:ee:ff"), "EEFF");
/// assert_eq!(short_address("AA-BB-CC-DD-EE-FF"), "EEFF");
/// ```
pub fn short_address(address: &str) -> String {
    let normalized = address.replace('-', ":");
    let mut groups = normalized.rsplit(':');
    let last = groups.next().unwrap_or_default();
    let second_last = groups.next().unwrap_or_default();
    let combined = format!(
        "{}{}",
        second_last.to_uppercase(),
        last.to_uppercase()
    );
    let start = combined.len().saturating_sub(4);
    combined.get(start..).unwrap_or(combined.as_str()).to_owned()
}
