use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unrecognized month descriptor {0:?}")]
    Unrecognized(String),
    #[error("month descriptor {raw:?} does not match {format}")]
    Format { raw: String, format: &'static str },
}

/// Parse a remote month descriptor relative to `today`.
///
/// Accepted forms, in order: a full timestamp (truncated to its date), `This Month`,
/// `Before Last Month`, then the last whitespace-separated token as `YYYY/MM`,
/// `YYYY-MM-DD` or `Mon-YYYY`. Month-only forms resolve to the first day of the month.
pub fn parse_month_date(raw: &str, today: NaiveDate) -> Result<NaiveDate, ParseError> {
    let value = raw.trim();
    if let Some(date) = parse_timestamp(value) {
        return Ok(date);
    }
    match value {
        "This Month" => return Ok(first_of_month(today.year(), today.month())),
        "Before Last Month" => return Ok(before_last_month(today)),
        _ => {}
    }

    let token = value
        .split_whitespace()
        .last()
        .ok_or_else(|| ParseError::Unrecognized(raw.to_string()))?;

    if token.contains('/') {
        NaiveDate::parse_from_str(&format!("{token}/01"), "%Y/%m/%d").map_err(|_| {
            ParseError::Format {
                raw: raw.to_string(),
                format: "YYYY/MM",
            }
        })
    } else if token.contains('-') && token.chars().count() == 10 {
        NaiveDate::parse_from_str(token, "%Y-%m-%d").map_err(|_| ParseError::Format {
            raw: raw.to_string(),
            format: "YYYY-MM-DD",
        })
    } else {
        NaiveDate::parse_from_str(&format!("01-{token}"), "%d-%b-%Y")
            .map_err(|_| ParseError::Unrecognized(raw.to_string()))
    }
}

fn parse_timestamp(value: &str) -> Option<NaiveDate> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.date_naive());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| ts.date())
}

// The remote labels orders two months back this way; the year adjustment mirrors
// how the storefront computes it and must stay as is.
fn before_last_month(today: NaiveDate) -> NaiveDate {
    let current = today.month() as i32;
    let month = ((current - 1 - 2).rem_euclid(12) + 1) as u32;
    let year = if month as i32 > current {
        today.year() - 1
    } else {
        today.year()
    };
    first_of_month(year, month)
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

pub fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

pub fn first_day_of_next_month(today: NaiveDate) -> NaiveDate {
    if today.month() == 12 {
        first_of_month(today.year() + 1, 1)
    } else {
        first_of_month(today.year(), today.month() + 1)
    }
}
