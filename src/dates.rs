//! Resolution of `--from` / `--to` arguments into instants.
//!
//! Only ISO forms are understood: a full RFC 3339 instant, or a calendar date
//! which snaps to the start (for `from`) or end (for `to`) of that UTC day.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use thiserror::Error;

use crate::types::{DateRange, parse_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse date `{input}` (expected YYYY-MM-DD or an RFC 3339 timestamp)")]
pub struct DateParseError {
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

pub fn resolve_bound(text: &str, bound: Bound) -> Result<DateTime<Utc>, DateParseError> {
    let text = text.trim();
    if let Some(instant) = parse_timestamp(text) {
        return Ok(instant);
    }

    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| DateParseError {
        input: text.to_string(),
    })?;
    let time = match bound {
        Bound::Start => NaiveTime::MIN,
        Bound::End => {
            NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN)
        }
    };
    Ok(date.and_time(time).and_utc())
}

/// Build a range from optional CLI strings.
pub fn resolve_range(from: Option<&str>, to: Option<&str>) -> Result<DateRange, DateParseError> {
    Ok(DateRange::new(
        from.map(|f| resolve_bound(f, Bound::Start)).transpose()?,
        to.map(|t| resolve_bound(t, Bound::End)).transpose()?,
    ))
}
