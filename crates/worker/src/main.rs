// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotagate Background Worker
//!
//! Handles scheduled jobs:
//! - Free-plan usage reset check (daily; resets only on the configured day, once per period)
//! - Record invariant sweep (daily)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quotagate_billing::{
    BillingConfig, BillingResult, InvariantCheckSummary, InvariantChecker, PgUserStore,
    ResetOutcome, UsageReset, ViolationSeverity,
};
use quotagate_shared::{create_pool, run_migrations};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_RESET_CHECK_CRON: &str = "0 5 0 * * *";
pub const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 30 0 * * *";

/// Cron expressions (seconds field first, UTC)
#[derive(Debug, Clone, PartialEq, Eq)]
struct Schedules {
    reset_check: String,
    invariant_check: String,
}

impl Schedules {
    fn from_env() -> Self {
        let read = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            reset_check: read("RESET_CHECK_CRON", DEFAULT_RESET_CHECK_CRON),
            invariant_check: read("INVARIANT_CHECK_CRON", DEFAULT_INVARIANT_CHECK_CRON),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,quotagate_worker=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn log_reset_outcome(result: BillingResult<ResetOutcome>) {
    match result {
        Ok(ResetOutcome::NotResetDay) => {}
        Ok(ResetOutcome::AlreadyDone { period }) => {
            info!(period = %period, "Usage reset already applied")
        }
        Ok(ResetOutcome::Reset { period, records }) => {
            info!(period = %period, records, "Usage reset complete")
        }
        Err(e) => error!(error = %e, kind = ?e.kind(), "Usage reset failed"),
    }
}

/// Log results of an invariant sweep
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant sweep complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                identities = ?violation.identities,
                severity = %violation.severity,
                "{}",
                violation.description
            ),
            _ => warn!(
                invariant = %violation.invariant,
                identities = ?violation.identities,
                severity = %violation.severity,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Quotagate Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let billing_config = BillingConfig::from_env()?;
    let schedules = Schedules::from_env();

    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let store = Arc::new(PgUserStore::new(pool.clone(), billing_config.store_timeout));
    let reset = Arc::new(UsageReset::new(store, billing_config.reset));
    let checker = Arc::new(InvariantChecker::new(pool));

    // Catch up on a reset day that passed while no worker was running
    log_reset_outcome(reset.catch_up(OffsetDateTime::now_utc()).await);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Usage reset check
    let reset_job = reset.clone();
    scheduler
        .add(Job::new_async(schedules.reset_check.as_str(), move |_uuid, _l| {
            let reset = reset_job.clone();
            Box::pin(async move {
                info!("Running scheduled usage reset check");
                log_reset_outcome(reset.run(OffsetDateTime::now_utc()).await);
            })
        })?)
        .await?;
    info!(cron = %schedules.reset_check, "Scheduled: Usage reset check");

    // Job 2: Invariant sweep
    let sweep_checker = checker.clone();
    scheduler
        .add(Job::new_async(schedules.invariant_check.as_str(), move |_uuid, _l| {
            let checker = sweep_checker.clone();
            Box::pin(async move {
                info!("Running invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %schedules.invariant_check, "Scheduled: Invariant sweep");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Quotagate Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_schedules_default() {
        std::env::remove_var("RESET_CHECK_CRON");
        std::env::remove_var("INVARIANT_CHECK_CRON");
        let schedules = Schedules::from_env();
        assert_eq!(schedules.reset_check, DEFAULT_RESET_CHECK_CRON);
        assert_eq!(schedules.invariant_check, DEFAULT_INVARIANT_CHECK_CRON);
    }

    #[test]
    #[serial]
    fn test_schedules_override() {
        std::env::set_var("RESET_CHECK_CRON", " 0 0 15 * * * ");
        let schedules = Schedules::from_env();
        assert_eq!(schedules.reset_check, "0 0 15 * * *");
        std::env::remove_var("RESET_CHECK_CRON");
    }
}
