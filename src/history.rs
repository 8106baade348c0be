//! Historical series files and holding-period helpers.
//!
//! Series files hold one percentage per line ("7.20" is 7.20%). Values are
//! converted to decimal rates rounded to five places.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use thiserror::Error;
use tracing::debug;

use crate::core::{RateSeries, SimError};

const DECIMAL_PLACES: f64 = 1e5;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: invalid percentage {value:?}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("{}: {source}", path.display())]
    Series {
        path: PathBuf,
        #[source]
        source: SimError,
    },
}

pub fn read_percent_series(path: &Path) -> Result<RateSeries, HistoryError> {
    let text = fs::read_to_string(path).map_err(|source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let series = parse_percent_series(&text, path)?;
    debug!(path = %path.display(), values = series.len(), "loaded series");
    Ok(series)
}

/// Parses percentage lines; `origin` only labels errors. Trailing blank lines
/// are ignored, a blank line before the last value is malformed.
pub fn parse_percent_series(text: &str, origin: &Path) -> Result<RateSeries, HistoryError> {
    let lines: Vec<&str> = text.lines().collect();
    let end = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map_or(0, |last| last + 1);

    let mut values = Vec::with_capacity(end);
    for (idx, raw) in lines[..end].iter().enumerate() {
        let trimmed = raw.trim();
        let pct: f64 = trimmed
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| HistoryError::Parse {
                path: origin.to_path_buf(),
                line: idx + 1,
                value: trimmed.to_string(),
            })?;
        values.push(percent_to_decimal(pct));
    }
    RateSeries::new(values).map_err(|source| HistoryError::Series {
        path: origin.to_path_buf(),
        source,
    })
}

/// Converts a percentage to a decimal rounded to five places. The scaled
/// value rounds half away from zero, so an exact tie in the fifth place may
/// land one unit away from a round-half-even of the quotient.
pub fn percent_to_decimal(pct: f64) -> f64 {
    (pct / 100.0 * DECIMAL_PLACES).round() / DECIMAL_PLACES
}

/// Days from `today` until the next occurrence of `cutoff`, rolling the
/// cut-off forward a year at a time while it is on or before today.
pub fn days_until_cutoff(today: NaiveDate, cutoff: NaiveDate) -> u32 {
    let mut cutoff = cutoff;
    while cutoff <= today {
        cutoff += Duration::days(365);
    }
    (cutoff - today).num_days() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn percentages_become_rounded_decimals() {
        let series = parse_percent_series("7.20\n-3.5\n  12 \n1.234567\n\n\n", Path::new("mem"))
            .expect("valid series");
        assert_eq!(series.values(), &[0.072, -0.035, 0.12, 0.01235]);
    }

    #[test]
    fn malformed_line_reports_path_and_line() {
        let err = parse_percent_series("1.0\nabc\n", Path::new("returns.txt"))
            .expect_err("must reject");
        match &err {
            HistoryError::Parse { line, value, .. } => {
                assert_eq!(*line, 2);
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().starts_with("returns.txt:2"));
    }

    #[test]
    fn interior_blank_line_is_rejected() {
        let err = parse_percent_series("1.0\n\n2.0\n", Path::new("gaps.txt"))
            .expect_err("must reject");
        match err {
            HistoryError::Parse { line, value, .. } => {
                assert_eq!(line, 2);
                assert!(value.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rounding_is_symmetric_around_zero() {
        assert_eq!(percent_to_decimal(1.234567), 0.01235);
        assert_eq!(percent_to_decimal(-1.234567), -0.01235);
        assert_eq!(percent_to_decimal(-2.5), -percent_to_decimal(2.5));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert!(parse_percent_series("inf\n", Path::new("mem")).is_err());
        assert!(parse_percent_series("NaN\n", Path::new("mem")).is_err());
    }

    #[test]
    fn empty_file_is_a_series_error() {
        let err = parse_percent_series("\n\n", Path::new("empty.txt")).expect_err("must reject");
        assert!(matches!(err, HistoryError::Series { .. }));
    }

    #[test]
    fn reads_series_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "10").expect("write");
        writeln!(file, "-5.5").expect("write");
        let series = read_percent_series(file.path()).expect("readable");
        assert_eq!(series.values(), &[0.1, -0.055]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = read_percent_series(&dir.path().join("absent.txt")).expect_err("must fail");
        assert!(matches!(err, HistoryError::Io { .. }));
    }

    #[test]
    fn cutoff_in_the_future_is_counted_directly() {
        assert_eq!(days_until_cutoff(date(2024, 4, 1), date(2024, 4, 13)), 12);
    }

    #[test]
    fn cutoff_today_or_past_rolls_forward_a_year() {
        assert_eq!(days_until_cutoff(date(2024, 4, 13), date(2024, 4, 13)), 365);
        assert_eq!(days_until_cutoff(date(2024, 5, 1), date(2024, 4, 13)), 347);
        assert!(days_until_cutoff(date(2026, 10, 16), date(2024, 4, 13)) <= 365);
    }
}
