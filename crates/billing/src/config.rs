//! Quota and reset configuration

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_FREE_PLAN_LIMIT: u32 = 10;
pub const DEFAULT_RESET_DAY: u32 = 1;
pub const DEFAULT_TIME_ZONE: &str = "Asia/Tokyo";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;

/// Monthly Free-quota reset schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSchedule {
    /// Day of month, 1..=31. Months shorter than this reset on their last day.
    pub day: u32,
    pub time_zone: Tz,
}

impl ResetSchedule {
    pub fn new(day: u32, time_zone: Tz) -> BillingResult<Self> {
        if !(1..=31).contains(&day) {
            return Err(BillingError::Config(format!(
                "reset day must be between 1 and 31, got {}",
                day
            )));
        }
        Ok(Self { day, time_zone })
    }

    fn local(&self, now: OffsetDateTime) -> DateTime<Tz> {
        DateTime::<Utc>::from_timestamp(now.unix_timestamp(), 0)
            .unwrap_or_default()
            .with_timezone(&self.time_zone)
    }

    /// Reset day for the month of `local`, clamped to the month's last day.
    fn effective_day(&self, local: &DateTime<Tz>) -> u32 {
        let date = local.date_naive();
        let (year, month) = if date.month() == 12 {
            (date.year() + 1, 1)
        } else {
            (date.year(), date.month() + 1)
        };
        let last_day = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|first| first.pred_opt())
            .map(|last| last.day())
            .unwrap_or(28);
        self.day.min(last_day)
    }

    /// Whether `now`, seen in the configured zone, falls on the reset day.
    pub fn is_reset_day(&self, now: OffsetDateTime) -> bool {
        let local = self.local(now);
        local.day() == self.effective_day(&local)
    }

    /// Whether this month's reset day has arrived, in the configured zone.
    pub fn reset_day_reached(&self, now: OffsetDateTime) -> bool {
        let local = self.local(now);
        local.day() >= self.effective_day(&local)
    }

    /// Billing period label (`YYYY-MM`) in the configured zone.
    pub fn period_key(&self, now: OffsetDateTime) -> String {
        let local = self.local(now);
        format!("{:04}-{:02}", local.year(), local.month())
    }
}

impl Default for ResetSchedule {
    fn default() -> Self {
        Self {
            day: DEFAULT_RESET_DAY,
            time_zone: chrono_tz::Asia::Tokyo,
        }
    }
}

/// Quota limit, reset schedule and store deadline.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub quota_limit: u32,
    pub reset: ResetSchedule,
    pub store_timeout: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            quota_limit: DEFAULT_FREE_PLAN_LIMIT,
            reset: ResetSchedule::default(),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let quota_limit = env_or("FREE_PLAN_LIMIT", DEFAULT_FREE_PLAN_LIMIT)?;
        let day = env_or("BILLING_RESET_DAY", DEFAULT_RESET_DAY)?;
        let zone_name =
            std::env::var("BILLING_TIME_ZONE").unwrap_or_else(|_| DEFAULT_TIME_ZONE.to_string());
        let time_zone: Tz = zone_name.parse().map_err(|_| {
            BillingError::Config(format!("unknown BILLING_TIME_ZONE: {}", zone_name))
        })?;
        let timeout_ms = env_or("STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;

        Ok(Self {
            quota_limit,
            reset: ResetSchedule::new(day, time_zone)?,
            store_timeout: Duration::from_millis(timeout_ms),
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("invalid value for {}: {}", key, raw))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use time::macros::datetime;

    fn clear_env() {
        for key in [
            "FREE_PLAN_LIMIT",
            "BILLING_RESET_DAY",
            "BILLING_TIME_ZONE",
            "STORE_TIMEOUT_MS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.quota_limit, 10);
        assert_eq!(config.reset.day, 1);
        assert_eq!(config.reset.time_zone, chrono_tz::Asia::Tokyo);
        assert_eq!(config.store_timeout, Duration::from_millis(5000));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("FREE_PLAN_LIMIT", "25");
        std::env::set_var("BILLING_RESET_DAY", "15");
        std::env::set_var("BILLING_TIME_ZONE", "UTC");
        let config = BillingConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.quota_limit, 25);
        assert_eq!(config.reset.day, 15);
        assert_eq!(config.reset.time_zone, chrono_tz::UTC);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        std::env::set_var("BILLING_TIME_ZONE", "Mars/Olympus");
        assert!(matches!(
            BillingConfig::from_env(),
            Err(BillingError::Config(_))
        ));
        clear_env();

        std::env::set_var("BILLING_RESET_DAY", "32");
        assert!(BillingConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_reset_day_uses_configured_zone() {
        let schedule = ResetSchedule::default();
        // 2025-03-31 15:30 UTC is already April 1st in Tokyo
        assert!(schedule.is_reset_day(datetime!(2025-03-31 15:30 UTC)));
        assert!(!schedule.is_reset_day(datetime!(2025-03-31 14:30 UTC)));
        assert_eq!(schedule.period_key(datetime!(2025-03-31 15:30 UTC)), "2025-04");
    }

    #[test]
    fn test_reset_day_clamps_to_month_end() {
        let schedule = ResetSchedule::new(31, chrono_tz::UTC).unwrap();
        assert!(schedule.is_reset_day(datetime!(2025-02-28 12:00 UTC)));
        assert!(!schedule.is_reset_day(datetime!(2025-02-27 12:00 UTC)));
        assert!(schedule.is_reset_day(datetime!(2025-03-31 12:00 UTC)));
        assert!(!schedule.is_reset_day(datetime!(2025-03-30 12:00 UTC)));
    }
}
