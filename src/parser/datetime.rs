use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Unix seconds of the zero-time instant reported by
/// `get_elastic_date_time` on a missing non-nullable field
/// (0001-01-01T00:00:00Z).
pub const ZERO_TIME_UNIX_SECONDS: i64 = -62_135_596_800;

/// Parse a record timestamp string.
///
/// Accepted shapes: RFC 3339 / ISO-8601 with or without fractional
/// seconds and offset, the ClickHouse form `YYYY-MM-DD HH:MM:SS[.fff]`,
/// and a bare date. Strings without an offset are interpreted in `tz`.
pub fn parse_datetime_str(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return local_to_utc(naive, tz);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return local_to_utc(date.and_hms_opt(0, 0, 0)?, tz);
    }
    None
}

/// Convert a numeric timestamp to an instant. `time_unit` scales the raw
/// number to seconds (e.g. 0.001 for millisecond inputs); fractional
/// seconds are preserved at millisecond resolution.
pub fn from_unix_float(value: f64, time_unit: f64) -> Option<DateTime<Utc>> {
    let seconds = value * time_unit;
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
}

fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // DST gap or fold: take the earliest valid interpretation
        LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    fn utc() -> Tz {
        chrono_tz::UTC
    }

    #[test]
    fn rfc3339_with_and_without_millis() {
        let sec = parse_datetime_str("2019-12-16T12:10:30Z", utc()).unwrap();
        assert_eq!(sec.timestamp(), 1_576_498_230);
        assert_eq!(sec.timestamp_subsec_millis(), 0);

        let ms = parse_datetime_str("2019-12-16T12:10:30.123Z", utc()).unwrap();
        assert_eq!(ms.timestamp(), 1_576_498_230);
        assert_eq!(ms.timestamp_subsec_millis(), 123);

        let offset = parse_datetime_str("2019-12-16T12:10:30+08:00", utc()).unwrap();
        assert_eq!(offset.timestamp(), 1_576_498_230 - 8 * 3600);
    }

    #[test]
    fn clickhouse_form_uses_configured_timezone() {
        let in_utc = parse_datetime_str("2019-12-16 12:10:30", utc()).unwrap();
        assert_eq!(in_utc.timestamp(), 1_576_498_230);

        let shanghai: Tz = "Asia/Shanghai".parse().unwrap();
        let in_cst = parse_datetime_str("2019-12-16 12:10:30", shanghai).unwrap();
        assert_eq!(in_cst.timestamp(), 1_576_498_230 - 8 * 3600);

        let with_ms = parse_datetime_str("2019-12-16 12:10:30.123", utc()).unwrap();
        assert_eq!(with_ms.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn bare_date() {
        let dt = parse_datetime_str("2019-12-16", utc()).unwrap();
        assert_eq!(dt.to_rfc3339(), "2019-12-16T00:00:00+00:00");
    }

    #[test]
    fn numeric_timestamps_scale_by_unit() {
        let sec = from_unix_float(1_700_000_000.0, 1.0).unwrap();
        assert_eq!(sec.timestamp(), 1_700_000_000);

        let ms = from_unix_float(1_700_000_000_123.0, 0.001).unwrap();
        assert_eq!(ms.timestamp(), 1_700_000_000);
        assert_eq!(ms.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_datetime_str("", utc()).is_none());
        assert!(parse_datetime_str("not a time", utc()).is_none());
        assert!(from_unix_float(f64::NAN, 1.0).is_none());
    }
}
