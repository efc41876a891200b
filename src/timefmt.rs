//! Text forms of naive wall-clock timestamps.
//!
//! Stored timestamps sort lexicographically in chronological order, which
//! is what `MAX(timestamp)` watermarks rely on.

use chrono::NaiveDateTime;

pub const STORE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const MICROS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const PARSE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

pub fn format_store(ts: NaiveDateTime) -> String {
    ts.format(STORE_FORMAT).to_string()
}

pub fn format_micros(ts: NaiveDateTime) -> String {
    ts.format(MICROS_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    PARSE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn store_format_sorts_chronologically() {
        let a = NaiveDate::from_ymd_opt(2024, 1, 9)
            .and_then(|d| d.and_hms_opt(23, 59, 0))
            .expect("valid timestamp");
        let b = NaiveDate::from_ymd_opt(2024, 1, 10)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid timestamp");
        assert!(format_store(a) < format_store(b));
        assert_eq!(format_store(b), "2024-01-10 00:00:00");
    }

    #[test]
    fn parses_with_or_without_fraction_and_t_separator() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 6)
            .and_then(|d| d.and_hms_micro_opt(7, 8, 9, 123_456))
            .expect("valid timestamp");
        assert_eq!(parse_timestamp("2024-05-06 07:08:09.123456"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-06T07:08:09.123456"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-05-06 07:08:09"),
            NaiveDate::from_ymd_opt(2024, 5, 6).and_then(|d| d.and_hms_opt(7, 8, 9))
        );
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(format_micros(expected), "2024-05-06 07:08:09.123456");
    }
}
