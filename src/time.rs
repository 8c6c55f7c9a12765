use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// `now` shifted back by whole calendar months. Day-of-month is clamped to
/// the last day of the target month (Mar 31 minus one month is Feb 28/29).
pub fn months_before(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(months))
        .unwrap_or_default()
}

/// Archive retention period. One shard exists per calendar year (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodKey(i32);

impl PeriodKey {
    pub fn new(year: i32) -> Self {
        PeriodKey(year)
    }

    pub fn year(&self) -> i32 {
        self.0
    }

    pub fn containing(ms: i64) -> Self {
        PeriodKey(to_datetime(ms).year())
    }

    pub fn containing_date(date: DateTime<Utc>) -> Self {
        PeriodKey(date.year())
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

impl FromStr for PeriodKey {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        let trimmed = s.trim();
        if trimmed.len() != 4 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AppError::new(
                "TIME/INVALID_PERIOD",
                "Archive period must be a four digit year",
            )
            .with_context("value", s.to_string()));
        }
        trimmed
            .parse::<i32>()
            .map(PeriodKey)
            .map_err(|err| AppError::new("TIME/INVALID_PERIOD", err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn now_ms_is_reasonable() {
        let a = now_ms();
        assert!(a > 1_500_000_000_000);
        assert!(a < 4_100_000_000_000);
    }

    #[test]
    fn months_before_clamps_to_month_end() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap();
        let shifted = months_before(now, 1);
        assert_eq!(shifted, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());

        let year_ago = months_before(now, 12);
        assert_eq!(year_ago, Utc.with_ymd_and_hms(2023, 3, 31, 12, 0, 0).unwrap());
    }

    #[test]
    fn period_containing_uses_utc_year() {
        let last_ms_of_2022 = Utc
            .with_ymd_and_hms(2023, 1, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
            - 1;
        assert_eq!(PeriodKey::containing(last_ms_of_2022), PeriodKey::new(2022));
        assert_eq!(PeriodKey::containing(last_ms_of_2022 + 1), PeriodKey::new(2023));
    }

    #[test]
    fn period_parses_four_digit_years_only() {
        assert_eq!("2023".parse::<PeriodKey>().unwrap(), PeriodKey::new(2023));
        assert!("23".parse::<PeriodKey>().is_err());
        assert!("20x3".parse::<PeriodKey>().is_err());
        assert_eq!(PeriodKey::new(2023).to_string(), "2023");
    }
}
