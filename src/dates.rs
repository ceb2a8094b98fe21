use crate::error::{EtlError, Result};
use chrono::{Datelike, Days, NaiveDate};

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap_or(NaiveDate::MAX)
        .checked_sub_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX)
}

/// Snap any date to the closing date of its month. Filing periods are
/// always month-end cuts, but source files spell the same cut in several
/// ways (first of month, mid-month timestamps).
pub fn month_end(date: NaiveDate) -> NaiveDate {
    last_day_of_month(date.year(), date.month())
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Convert an Excel serial day number to a date (1900 date system).
///
/// Serial 1 is 1900-01-01, and Excel's phantom 1900-02-29 means serials
/// from 61 on are offset by one extra day.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    let days = serial.trunc() as i64;
    if days < 1 {
        return None;
    }
    let offset = if days >= 61 { days - 2 } else { days - 1 };
    NaiveDate::from_ymd_opt(1899, 12, 31)?.checked_add_days(Days::new(offset as u64 + 1))
}

/// Parse a date out of text: ISO date, ISO datetime, or `dd/mm/yyyy`.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    let date_part = trimmed.split(['T', ' ']).next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%d/%m/%Y"))
        .ok()
}

/// Extract the leading four-digit year from an archive file name
/// (`2023-balances.zip`, `2022_06_eeff.zip`).
pub fn year_from_name(name: &str) -> Result<i32> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 4 {
        if let Ok(year) = digits[..4].parse::<i32>() {
            if (1990..2100).contains(&year) {
                return Ok(year);
            }
        }
    }
    Err(EtlError::Date(format!(
        "no leading year in archive name '{}'",
        name
    )))
}

/// Find a `YYYY` + `MM` pair anywhere in a file name and return the
/// month-end date. Used as a fallback when a workbook carries no usable
/// as-of cell.
pub fn period_from_name(name: &str) -> Option<NaiveDate> {
    let mut runs: Vec<&str> = Vec::new();
    let mut start = None;
    for (i, c) in name.char_indices() {
        if c.is_ascii_digit() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            runs.push(&name[s..i]);
        }
    }
    if let Some(s) = start {
        runs.push(&name[s..]);
    }

    let mut year: Option<i32> = None;
    for run in &runs {
        // A single YYYYMM run is accepted as well.
        if run.len() == 6 {
            let (y, m) = (run[..4].parse::<i32>().ok()?, run[4..].parse::<u32>().ok()?);
            if (1990..2100).contains(&y) && (1..=12).contains(&m) {
                return Some(last_day_of_month(y, m));
            }
        }
        if run.len() == 4 {
            if let Ok(y) = run.parse::<i32>() {
                if (1990..2100).contains(&y) {
                    year = Some(y);
                    continue;
                }
            }
        }
        if let Some(y) = year {
            if run.len() <= 2 {
                if let Ok(m) = run.parse::<u32>() {
                    if (1..=12).contains(&m) {
                        return Some(last_day_of_month(y, m));
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2023, 2),
            NaiveDate::from_ymd_opt(2023, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2024, 2),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            last_day_of_month(2023, 12),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_month_end_snapping() {
        let mid = NaiveDate::from_ymd_opt(2023, 6, 1).unwrap();
        assert_eq!(month_end(mid), NaiveDate::from_ymd_opt(2023, 6, 30).unwrap());
    }

    #[test]
    fn test_months_between() {
        let a = NaiveDate::from_ymd_opt(2022, 11, 30).unwrap();
        let b = NaiveDate::from_ymd_opt(2023, 2, 28).unwrap();
        assert_eq!(months_between(a, b), 3);
        assert_eq!(months_between(b, a), -3);
    }

    #[test]
    fn test_excel_serial_to_date() {
        assert_eq!(
            excel_serial_to_date(45107.0),
            NaiveDate::from_ymd_opt(2023, 6, 30)
        );
        // Pre-phantom-leap-day serial
        assert_eq!(excel_serial_to_date(59.0), NaiveDate::from_ymd_opt(1900, 2, 28));
        assert_eq!(excel_serial_to_date(0.0), None);
    }

    #[test]
    fn test_parse_date_text() {
        assert_eq!(
            parse_date_text("2023-06-30T00:00:00"),
            NaiveDate::from_ymd_opt(2023, 6, 30)
        );
        assert_eq!(
            parse_date_text("31/01/2022"),
            NaiveDate::from_ymd_opt(2022, 1, 31)
        );
        assert_eq!(parse_date_text("not a date"), None);
    }

    #[test]
    fn test_year_from_name() {
        assert_eq!(year_from_name("2022-balances.zip").unwrap(), 2022);
        assert_eq!(year_from_name("2019_eeff.zip").unwrap(), 2019);
        assert!(year_from_name("balances.zip").is_err());
    }

    #[test]
    fn test_period_from_name() {
        assert_eq!(
            period_from_name("balance_mutualistas_2024_06.xlsx"),
            NaiveDate::from_ymd_opt(2024, 6, 30)
        );
        assert_eq!(
            period_from_name("indicadores-202312.xlsm"),
            NaiveDate::from_ymd_opt(2023, 12, 31)
        );
        assert_eq!(period_from_name("sin_fecha.xlsx"), None);
    }
}
