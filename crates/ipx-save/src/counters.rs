use once_cell::sync::Lazy;
use regex::Regex;

static COUNTERS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[([0-9]+):([0-9]+)\]$").expect("counters pattern is valid"));

/// Parse a `[packets:bytes]` token.
///
/// Returns `None` when the token does not match or either value
/// overflows `u64`.
pub fn parse_counters(token: &str) -> Option<(u64, u64)> {
    let caps = COUNTERS_REGEX.captures(token)?;
    let packets = caps[1].parse().ok()?;
    let bytes = caps[2].parse().ok()?;
    Some((packets, bytes))
}
