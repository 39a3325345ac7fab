//! Duration string parsing
//!
//! Parses the compact duration strings used in sync policies ("30s", "5m",
//! "1h30m") into `std::time::Duration`. Callers apply their own defaults
//! and floors; a malformed string simply parses to `None`.

use std::time::Duration;

/// Parse a duration string of the form `<number><unit>[<number><unit>...]`.
///
/// Supported units: `ms`, `s`, `m`, `h`. Fractional numbers are accepted
/// ("1.5h"). Returns `None` for empty, unit-less, or otherwise malformed
/// input.
///
/// # Examples
/// ```
/// use rag_common::duration::parse_duration_str;
/// use std::time::Duration;
/// assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
/// assert_eq!(parse_duration_str("1h30m"), Some(Duration::from_secs(5400)));
/// assert_eq!(parse_duration_str("twice a day"), None);
/// ```
pub fn parse_duration_str(value: &str) -> Option<Duration> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_secs = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None; // unit with no number
        }
        let number: f64 = rest[..num_end].parse().ok()?;

        let after_num = &rest[num_end..];
        let unit_end = after_num
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_num.len());
        let unit = &after_num[..unit_end];

        let factor = match unit {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None, // includes a bare number with no unit
        };

        total_secs += number * factor;
        rest = &after_num[unit_end..];
    }

    if !total_secs.is_finite() || total_secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration_str("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration_str("500ms"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(parse_duration_str("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration_str("1m30s"), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_duration_str("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration_str("0.5m"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_with_whitespace() {
        assert_eq!(parse_duration_str("  10m  "), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(parse_duration_str(""), None);
        assert_eq!(parse_duration_str("300"), None); // missing unit
        assert_eq!(parse_duration_str("m"), None); // missing number
        assert_eq!(parse_duration_str("5x"), None); // unknown unit
        assert_eq!(parse_duration_str("five minutes"), None);
    }
}
