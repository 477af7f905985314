use std::time::Duration;

use chrono::{DateTime, Utc};

/// Compact human-readable duration: `850ms`, `4.2s`, `3m 07s`, `1h 02m`.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis < 1_000 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs < 60 {
        return format!("{:.1}s", d.as_secs_f64());
    }
    if secs < 3_600 {
        return format!("{}m {:02}s", secs / 60, secs % 60);
    }
    format!("{}h {:02}m", secs / 3_600, (secs % 3_600) / 60)
}

/// RFC3339 timestamp with millisecond precision, as written into run reports.
pub fn rfc3339_millis(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_duration_ranges() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(4_200)), "4.2s");
        assert_eq!(format_duration(Duration::from_secs(187)), "3m 07s");
        assert_eq!(format_duration(Duration::from_secs(3_720)), "1h 02m");
    }

    #[test]
    fn test_rfc3339_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 7, 30).unwrap();
        assert_eq!(rfc3339_millis(ts), "2024-01-01T12:07:30.000Z");
    }
}
