//! Parsing of abbreviated engagement counters (`"1.2K"`, `"3M"`, `"1,234"`).

use std::sync::LazyLock;

use regex::Regex;

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([0-9]+(?:\.[0-9]+)?)\s*([kmb])?\s*$").expect("valid count regex")
});

/// Parses a rendered counter into an integer.
///
/// Commas and surrounding whitespace are ignored; a trailing `K`, `M`, or `B`
/// (any case) multiplies by a thousand, million, or billion. Returns `None`
/// for text that is not a counter, so an unreadable counter is never stored
/// as zero.
#[must_use]
pub fn parse_count(text: &str) -> Option<i64> {
    let cleaned = text.replace(',', "");
    let caps = COUNT_RE.captures(&cleaned)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1.0,
        Some(suffix) => match suffix.as_str() {
            "k" => 1_000.0,
            "m" => 1_000_000.0,
            _ => 1_000_000_000.0,
        },
    };

    let value = (number * multiplier).round();
    if !value.is_finite() || value > 9.0e18 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_integer() {
        assert_eq!(parse_count("482"), Some(482));
    }

    #[test]
    fn comma_grouped() {
        assert_eq!(parse_count("1,234,567"), Some(1_234_567));
    }

    #[test]
    fn thousands_suffix_with_decimal() {
        assert_eq!(parse_count("1.2K"), Some(1_200));
        assert_eq!(parse_count("12.5k"), Some(12_500));
    }

    #[test]
    fn millions_and_billions() {
        assert_eq!(parse_count("3M"), Some(3_000_000));
        assert_eq!(parse_count("2.1B"), Some(2_100_000_000));
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(parse_count("  45 K "), Some(45_000));
    }

    #[test]
    fn non_numeric_text_is_none_not_zero() {
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("Followers"), None);
        assert_eq!(parse_count("1.2X"), None);
    }
}
