use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::error::{AnalysisError, Result};

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Parses the timestamp shapes seen in admissions exports. Offsets are dropped
/// after conversion so every timestamp lands on its local calendar day.
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    let s = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_local());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return Ok(dt);
            }
        }
    }

    Err(AnalysisError::Parse {
        field: "timestamp",
        value: value.to_string(),
    })
}

/// Birth dates may carry a time component; only the date part is kept.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    parse_timestamp(value)
        .map(|dt| dt.date())
        .map_err(|_| AnalysisError::Parse {
            field: "date",
            value: value.to_string(),
        })
}

pub fn format_timestamp(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Trimmed, lowercased quiz status.
pub fn normalize_quiz(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_common_timestamp_shapes() {
        let expected = ymd(2022, 5, 12).and_hms_opt(14, 43, 21).unwrap();
        assert_eq!(parse_timestamp("2022-05-12 14:43:21").unwrap(), expected);
        assert_eq!(parse_timestamp("2022-05-12T14:43:21").unwrap(), expected);
        assert_eq!(parse_timestamp("2022-05-12T14:43:21+02:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2022-05-12 14:43:21.250").unwrap().date(),
            ymd(2022, 5, 12)
        );
    }

    #[test]
    fn date_only_values_land_on_midnight() {
        let dt = parse_timestamp("2022-05-12").unwrap();
        assert_eq!(dt, ymd(2022, 5, 12).and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(parse_date("05/12/1994").unwrap(), ymd(1994, 5, 12));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_timestamp("not a date").unwrap_err();
        assert!(matches!(err, AnalysisError::Parse { field: "timestamp", .. }));
        assert!(parse_date("").is_err());
        assert!(parse_date("2022-02-30").is_err());
    }

    #[test]
    fn quiz_values_are_trimmed_and_lowercased() {
        assert_eq!(normalize_quiz("  Not Completed "), "not completed");
        assert_eq!(normalize_quiz("COMPLETED"), "completed");
    }
}
