//! Monthly Free-quota reset

use std::sync::Arc;

use time::OffsetDateTime;

use crate::config::ResetSchedule;
use crate::error::BillingResult;
use crate::store::UserStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Not the reset day in the configured zone
    NotResetDay,
    /// Another run already reset this period
    AlreadyDone { period: String },
    Reset { period: String, records: u64 },
}

/// Runs the Free usage reset at most once per billing period.
///
/// Safe to trigger daily or more often: the handler checks the day in the configured zone and
/// claims the period before touching any row.
#[derive(Clone)]
pub struct UsageReset {
    store: Arc<dyn UserStore>,
    schedule: ResetSchedule,
}

impl UsageReset {
    pub fn new(store: Arc<dyn UserStore>, schedule: ResetSchedule) -> Self {
        Self { store, schedule }
    }

    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<ResetOutcome> {
        if !self.schedule.is_reset_day(now) {
            tracing::debug!(reset_day = self.schedule.day, "Not the reset day, skipping");
            return Ok(ResetOutcome::NotResetDay);
        }
        self.claim(self.schedule.period_key(now)).await
    }

    /// Apply this period's reset if its day has already passed and nobody claimed it.
    ///
    /// Covers a trigger missed while no worker was running.
    pub async fn catch_up(&self, now: OffsetDateTime) -> BillingResult<ResetOutcome> {
        if !self.schedule.reset_day_reached(now) {
            return Ok(ResetOutcome::NotResetDay);
        }
        self.claim(self.schedule.period_key(now)).await
    }

    async fn claim(&self, period: String) -> BillingResult<ResetOutcome> {
        match self.store.reset_free_usage_once(&period).await? {
            None => {
                tracing::info!(period = %period, "Usage already reset for this period");
                Ok(ResetOutcome::AlreadyDone { period })
            }
            Some(records) => {
                tracing::info!(period = %period, records, "Reset Free plan usage");
                Ok(ResetOutcome::Reset { period, records })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserStore;
    use quotagate_shared::{PlanTier, UserRecord};
    use time::macros::datetime;

    async fn seeded() -> Arc<InMemoryUserStore> {
        let store = Arc::new(InMemoryUserStore::new());
        let mut free = UserRecord::new_free("U_free", "", datetime!(2025-03-01 00:00 UTC));
        free.usage_count = 10;
        let mut monthly = UserRecord::new_free("U_monthly", "", datetime!(2025-03-01 00:00 UTC));
        monthly.plan = PlanTier::Monthly;
        monthly.payment_customer_id = Some("cus_m".to_string());
        monthly.usage_count = 57;
        store.create(&free).await.unwrap();
        store.create(&monthly).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_reset_runs_once_per_period() {
        let store = seeded().await;
        let reset = UsageReset::new(store.clone(), ResetSchedule::default());

        // 2025-04-01 09:00 in Tokyo
        let first = reset.run(datetime!(2025-04-01 00:00 UTC)).await.unwrap();
        assert_eq!(
            first,
            ResetOutcome::Reset {
                period: "2025-04".to_string(),
                records: 1
            }
        );
        assert_eq!(store.get("U_free").await.unwrap().unwrap().usage_count, 0);
        assert_eq!(store.get("U_monthly").await.unwrap().unwrap().usage_count, 57);

        let second = reset.run(datetime!(2025-04-01 06:00 UTC)).await.unwrap();
        assert_eq!(
            second,
            ResetOutcome::AlreadyDone {
                period: "2025-04".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_reset_skipped_off_day() {
        let store = seeded().await;
        let reset = UsageReset::new(store.clone(), ResetSchedule::default());
        let outcome = reset.run(datetime!(2025-04-02 00:00 UTC)).await.unwrap();
        assert_eq!(outcome, ResetOutcome::NotResetDay);
        assert_eq!(store.get("U_free").await.unwrap().unwrap().usage_count, 10);
    }

    #[tokio::test]
    async fn test_reset_surfaces_store_failure() {
        let store = seeded().await;
        store.set_unavailable(true);
        let reset = UsageReset::new(store, ResetSchedule::default());
        let err = reset.run(datetime!(2025-04-01 00:00 UTC)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_catch_up_after_missed_reset_day() {
        let store = seeded().await;
        let reset = UsageReset::new(store.clone(), ResetSchedule::default());

        let outcome = reset.catch_up(datetime!(2025-04-05 00:00 UTC)).await.unwrap();
        assert_eq!(
            outcome,
            ResetOutcome::Reset {
                period: "2025-04".to_string(),
                records: 1
            }
        );
        assert_eq!(store.get("U_free").await.unwrap().unwrap().usage_count, 0);

        // The scheduled trigger later in the same period is a no-op
        let again = reset.catch_up(datetime!(2025-04-06 00:00 UTC)).await.unwrap();
        assert!(matches!(again, ResetOutcome::AlreadyDone { .. }));
    }

    #[tokio::test]
    async fn test_catch_up_before_reset_day_does_nothing() {
        let store = seeded().await;
        let schedule = ResetSchedule::new(15, chrono_tz::Asia::Tokyo).unwrap();
        let reset = UsageReset::new(store.clone(), schedule);

        let outcome = reset.catch_up(datetime!(2025-04-10 00:00 UTC)).await.unwrap();
        assert_eq!(outcome, ResetOutcome::NotResetDay);
        assert_eq!(store.get("U_free").await.unwrap().unwrap().usage_count, 10);
    }

    #[tokio::test]
    async fn test_catch_up_with_day_beyond_month_length() {
        let store = seeded().await;
        let schedule = ResetSchedule::new(31, chrono_tz::Asia::Tokyo).unwrap();
        let reset = UsageReset::new(store.clone(), schedule);

        // 2025-02-27 in Tokyo: February's reset falls on the 28th
        let early = reset.catch_up(datetime!(2025-02-27 00:00 UTC)).await.unwrap();
        assert_eq!(early, ResetOutcome::NotResetDay);
        let late = reset.catch_up(datetime!(2025-02-28 00:00 UTC)).await.unwrap();
        assert!(matches!(late, ResetOutcome::Reset { ref period, .. } if period == "2025-02"));
    }
}
