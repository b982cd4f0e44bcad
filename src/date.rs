use chrono::{Datelike, NaiveDate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid date {input:?}, want YYYY-MM-DD")]
pub struct DateParseError {
    pub input: String,
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// The year must be positive and the month and day must exist in the
/// calendar, so `2023-02-29` and `2024-13-01` are rejected.
pub fn parse_date(s: &str) -> Result<NaiveDate, DateParseError> {
    let err = || DateParseError {
        input: s.to_string(),
    };

    let mut parts = s.split('-');
    let (Some(y), Some(m), Some(d), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(err());
    };
    if y.len() != 4 || m.len() != 2 || d.len() != 2 {
        return Err(err());
    }
    if ![y, m, d].iter().all(|p| p.bytes().all(|b| b.is_ascii_digit())) {
        return Err(err());
    }

    let year: i32 = y.parse().map_err(|_| err())?;
    let month: u32 = m.parse().map_err(|_| err())?;
    let day: u32 = d.parse().map_err(|_| err())?;
    if year <= 0 {
        return Err(err());
    }
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(err)
}

/// Search clause covering exactly one calendar day, in the provider's
/// `YYYY/MM/DD` syntax.
pub fn day_query(date: NaiveDate) -> String {
    let next = date.succ_opt().unwrap_or(date);
    format!(
        "after:{}/{:02}/{:02} before:{}/{:02}/{:02}",
        date.year(),
        date.month(),
        date.day(),
        next.year(),
        next.month(),
        next.day()
    )
}
