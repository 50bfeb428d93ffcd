//! The wire duration format used by the `wait` query parameter and the
//! `Nexus-Request-Timeout` header.
//!
//! Decoding accepts exactly `^\d+(\.\d+)?(ns|us|µs|ms|s|m|h)$`; fractional
//! values are truncated to the nearest non-zero lower unit. Encoding emits
//! integer milliseconds (with a nanosecond fallback for sub-millisecond
//! values), which is always within the accepted grammar. We deliberately
//! keep this parser small and strict rather than pulling in a general
//! duration library that would accept inputs the wire rejects.

use std::time::Duration;

use thiserror::Error;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Error parsing a wire duration string.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("invalid wire duration {input:?}")]
pub struct ParseDurationError {
    input: String,
}

impl ParseDurationError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_owned(),
        }
    }
}

/// Parse a wire duration like `250ms`, `1.5s` or `2m`.
pub fn parse(input: &str) -> Result<Duration, ParseDurationError> {
    let (magnitude, unit_nanos) = split_unit(input)?;

    let (whole, frac) = match magnitude.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (magnitude, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseDurationError::new(input));
    }
    let whole = whole
        .parse::<u128>()
        .map_err(|_| ParseDurationError::new(input))?;

    let mut nanos = whole.saturating_mul(unit_nanos);
    if let Some(frac) = frac {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseDurationError::new(input));
        }
        // Truncating integer math: 1.5ms => 500_000ns, 1.0000009ms => 0ns
        // extra. Limit the digits we look at so the scale can't overflow.
        let mut frac_nanos: u128 = 0;
        let mut scale = unit_nanos;
        for b in frac.bytes() {
            scale /= 10;
            if scale == 0 {
                break;
            }
            frac_nanos += u128::from(b - b'0') * scale;
        }
        nanos = nanos.saturating_add(frac_nanos);
    }

    Ok(duration_from_nanos(nanos))
}

/// Format a [`Duration`] for the wire.
pub fn format(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 && !duration.is_zero() {
        format!("{}ns", duration.as_nanos())
    } else {
        format!("{millis}ms")
    }
}

/// Split `"1.5s"` into `("1.5", nanos_per_second)`.
fn split_unit(input: &str) -> Result<(&str, u128), ParseDurationError> {
    // Two-byte suffixes must be checked before the one-byte ones since
    // e.g. "ms" also ends in "s". "µs" is two chars but three bytes.
    const UNITS: &[(&str, u128)] = &[
        ("ns", 1),
        ("us", 1_000),
        ("µs", 1_000),
        ("ms", 1_000_000),
        ("s", NANOS_PER_SEC),
        ("m", 60 * NANOS_PER_SEC),
        ("h", 3_600 * NANOS_PER_SEC),
    ];
    for (suffix, nanos) in UNITS {
        if let Some(magnitude) = input.strip_suffix(suffix) {
            return Ok((magnitude, *nanos));
        }
    }
    Err(ParseDurationError::new(input))
}

/// Saturating conversion from u128 nanoseconds.
fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = nanos / NANOS_PER_SEC;
    let subsec = (nanos % NANOS_PER_SEC) as u32;
    match u64::try_from(secs) {
        Ok(secs) => Duration::new(secs, subsec),
        Err(_) => Duration::MAX,
    }
}
