//! Billing Invariants Module
//!
//! Two layers of consistency checking for user records:
//!
//! 1. **Write guards** (`check_record`, `check_transition`): pure checks run in the store
//!    write path before any row is persisted. A failure refuses the write.
//! 2. **Sweeps** (`InvariantChecker`): a read-only scan of paid rows run on a schedule to find
//!    rows that drifted anyway (manual edits, restored backups).

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use quotagate_shared::UserRecord;

use crate::error::{BillingError, BillingResult};

/// Refuse a record that breaks a per-row invariant.
pub fn check_record(record: &UserRecord) -> BillingResult<()> {
    if record.is_paid() && record.payment_customer_id.is_none() {
        return Err(violation(record, "paid plan without payment customer id"));
    }
    Ok(())
}

/// Refuse a transition that breaks a cross-write invariant.
pub fn check_transition(before: &UserRecord, after: &UserRecord) -> BillingResult<()> {
    if before.identity != after.identity {
        return Err(violation(before, "identity is immutable"));
    }

    match (&before.payment_customer_id, &after.payment_customer_id) {
        (Some(_), None) => return Err(violation(before, "payment customer id cleared")),
        (Some(old), Some(new)) if old != new => {
            tracing::warn!(
                target: "billing_alert",
                identity = %before.identity,
                old_customer_id = %old,
                new_customer_id = %new,
                "Payment customer id replaced"
            );
        }
        _ => {}
    }

    check_record(after)
}

fn violation(record: &UserRecord, reason: &str) -> BillingError {
    tracing::error!(
        identity = %record.identity,
        plan = %record.plan,
        reason,
        "Refusing write that violates a record invariant"
    );
    BillingError::InvariantViolation {
        identity: record.identity.clone(),
        reason: reason.to_string(),
    }
}

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Identities affected
    pub identities: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - a paying user may be locked out or a free user unmetered
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Row shape read by the sweep
#[derive(Debug, sqlx::FromRow)]
struct SweepRow {
    identity: String,
    plan: String,
    payment_customer_id: Option<String>,
    payment_subscription_id: Option<String>,
    subscription_started_at: Option<OffsetDateTime>,
}

impl From<&UserRecord> for SweepRow {
    fn from(record: &UserRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            plan: record.plan.to_string(),
            payment_customer_id: record.payment_customer_id.clone(),
            payment_subscription_id: record.payment_subscription_id.clone(),
            subscription_started_at: record.subscription_started_at,
        }
    }
}

fn missing_customer(row: &SweepRow) -> bool {
    row.payment_customer_id.is_none()
}

fn missing_subscription(row: &SweepRow) -> bool {
    row.payment_subscription_id.is_none()
}

fn missing_start(row: &SweepRow) -> bool {
    row.subscription_started_at.is_none()
}

struct SweepRule {
    name: &'static str,
    severity: ViolationSeverity,
    description: &'static str,
    violated: fn(&SweepRow) -> bool,
}

// A Free row may keep `payment_subscription_id` after a past_due/unpaid downgrade so a later
// recovery update re-links it. Only deletion clears it, so that state is not a violation.
const SWEEP_RULES: &[SweepRule] = &[
    SweepRule {
        name: "paid_has_customer",
        severity: ViolationSeverity::Critical,
        description: "Paid user has no payment customer",
        violated: missing_customer,
    },
    SweepRule {
        name: "paid_has_subscription",
        severity: ViolationSeverity::High,
        description: "Paid user is not backed by a subscription",
        violated: missing_subscription,
    },
    SweepRule {
        name: "paid_has_subscription_start",
        severity: ViolationSeverity::Medium,
        description: "Paid user has no subscription start timestamp",
        violated: missing_start,
    },
];

fn is_paid_row(row: &SweepRow) -> bool {
    row.plan != "free"
}

/// Violations for one row. Every rule applies to paid rows only.
fn row_violations(row: &SweepRow) -> Vec<InvariantViolation> {
    if !is_paid_row(row) {
        return Vec::new();
    }
    SWEEP_RULES
        .iter()
        .filter(|rule| (rule.violated)(row))
        .map(|rule| InvariantViolation {
            invariant: rule.name.to_string(),
            identities: vec![row.identity.clone()],
            description: rule.description.to_string(),
            context: serde_json::json!({
                "plan": row.plan,
                "customer_id": row.payment_customer_id,
                "subscription_id": row.payment_subscription_id,
            }),
            severity: rule.severity,
        })
        .collect()
}

/// Service for running invariant sweeps over `line_users`
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let rows: Vec<SweepRow> = sqlx::query_as(
            r#"
            SELECT identity, plan, payment_customer_id, payment_subscription_id,
                   subscription_started_at
            FROM line_users
            WHERE plan <> 'free'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let violations = rows.iter().flat_map(row_violations).collect();
        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        SWEEP_RULES.iter().map(|rule| rule.name).collect()
    }
}
