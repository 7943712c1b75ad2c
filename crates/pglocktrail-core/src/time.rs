//! Timestamp parsing for PostgreSQL log lines.
//!
//! PostgreSQL prints `%m`/`%t` prefixes and csv/json `log_time` as
//! `YYYY-MM-DD HH:MM:SS[.fff] TZ` where `TZ` is a zone abbreviation or a
//! numeric offset, depending on `log_timezone`.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Parse a log timestamp into UTC.
///
/// `UTC`, `GMT`, `Z` and numeric offsets (`+03`, `-0530`, `+05:30`) are
/// honored. Other zone abbreviations are ambiguous and read as UTC.
pub fn parse_log_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let head = s.get(..19)?;
    let naive = NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S").ok()?;
    let mut rest = &s[19..];

    let mut nanos: i64 = 0;
    if let Some(frac) = rest.strip_prefix('.') {
        let digits = frac.bytes().take_while(u8::is_ascii_digit).count();
        let taken = &frac[..digits.min(9)];
        if let Ok(v) = taken.parse::<i64>() {
            nanos = v * 10_i64.pow(9 - taken.len() as u32);
        }
        rest = &frac[digits..];
    }

    let offset_secs = parse_zone(rest.trim()).unwrap_or(0);
    let utc = naive + Duration::nanoseconds(nanos) - Duration::seconds(offset_secs);
    Some(utc.and_utc())
}

/// Seconds east of UTC, or `None` for unknown zone names.
fn parse_zone(zone: &str) -> Option<i64> {
    match zone {
        "" | "UTC" | "GMT" | "Z" => return Some(0),
        _ => {}
    }
    let (sign, digits) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let compact: String = digits.chars().filter(|c| *c != ':').collect();
    if compact.is_empty() || !compact.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match compact.len() {
        1 | 2 => (compact.parse::<i64>().ok()?, 0),
        4 => (
            compact[..2].parse::<i64>().ok()?,
            compact[2..].parse::<i64>().ok()?,
        ),
        _ => return None,
    };
    Some(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_utc_with_millis() {
        let ts = parse_log_timestamp("2024-03-01 12:30:45.123 UTC").unwrap();
        assert_eq!(
            ts,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap() + Duration::milliseconds(123)
        );
    }

    #[test]
    fn test_numeric_offsets() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 45).unwrap();
        assert_eq!(parse_log_timestamp("2024-03-01 12:30:45 +03"), Some(expected));
        assert_eq!(parse_log_timestamp("2024-03-01 12:30:45+03:00"), Some(expected));
        assert_eq!(
            parse_log_timestamp("2024-03-01 04:00:45 -0530"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 45).unwrap())
        );
    }

    #[test]
    fn test_unknown_zone_reads_as_utc() {
        assert_eq!(
            parse_log_timestamp("2024-03-01 12:30:45 MSK"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap())
        );
    }

    #[test]
    fn test_garbage() {
        assert_eq!(parse_log_timestamp("not a timestamp"), None);
        assert_eq!(parse_log_timestamp("2024-13-01 00:00:00"), None);
        assert_eq!(parse_log_timestamp(""), None);
    }
}
