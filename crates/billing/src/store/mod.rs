//! User record storage
//!
//! `UserStore` is the only shared mutable resource in the system. Every read-modify-write
//! goes through [`update_with`], which re-reads the row, lets the caller decide the next
//! state, validates invariants and commits with a compare-and-swap on `version`.

mod memory;
mod postgres;

pub use memory::InMemoryUserStore;
pub use postgres::PgUserStore;

use std::time::Duration;

use async_trait::async_trait;
use quotagate_shared::{PlanTier, UserRecord};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::invariants;

/// Optimistic write attempts after the first before giving up.
pub const MAX_CAS_RETRIES: usize = 4;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, identity: &str) -> BillingResult<Option<UserRecord>>;

    /// Insert `record` unless the identity already exists; returns the stored row either way.
    async fn create(&self, record: &UserRecord) -> BillingResult<UserRecord>;

    /// Persist `record` if the stored version still equals `record.version`.
    ///
    /// Returns the stored row with its bumped version, or `None` when another writer got there
    /// first.
    async fn compare_and_swap(&self, record: &UserRecord) -> BillingResult<Option<UserRecord>>;

    async fn find_by_payment_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>>;

    /// Zero `usage_count` on every Free record. Returns the number of rows touched.
    async fn reset_all_free_usage(&self) -> BillingResult<u64>;

    /// Mark a billing period's reset as done. Only the first caller per period gets `true`.
    async fn claim_reset_period(&self, period: &str) -> BillingResult<bool>;

    /// Claim `period` and reset Free usage as one step.
    ///
    /// Returns `None` when the period was already claimed.
    async fn reset_free_usage_once(&self, period: &str) -> BillingResult<Option<u64>> {
        if !self.claim_reset_period(period).await? {
            return Ok(None);
        }
        self.reset_all_free_usage().await.map(Some)
    }
}

/// Partial field update. `None` leaves a field untouched; the nested options set or clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub display_name: Option<String>,
    pub plan: Option<PlanTier>,
    pub usage_count: Option<u32>,
    pub last_used_at: Option<OffsetDateTime>,
    pub subscription_started_at: Option<Option<OffsetDateTime>>,
    pub payment_customer_id: Option<String>,
    pub payment_subscription_id: Option<Option<String>>,
    pub conversation_token: Option<Option<String>>,
}

impl UserPatch {
    pub fn apply(&self, record: &UserRecord) -> UserRecord {
        let mut next = record.clone();
        if let Some(name) = &self.display_name {
            next.display_name = name.clone();
        }
        if let Some(plan) = self.plan {
            next.plan = plan;
        }
        if let Some(count) = self.usage_count {
            next.usage_count = count;
        }
        if let Some(at) = self.last_used_at {
            next.last_used_at = at;
        }
        if let Some(started) = self.subscription_started_at {
            next.subscription_started_at = started;
        }
        if let Some(customer) = &self.payment_customer_id {
            next.payment_customer_id = Some(customer.clone());
        }
        if let Some(subscription) = &self.payment_subscription_id {
            next.payment_subscription_id = subscription.clone();
        }
        if let Some(token) = &self.conversation_token {
            next.conversation_token = token.clone();
        }
        next
    }
}

/// Result of a guarded read-modify-write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No record for the identity
    Missing,
    /// The decision left the record as it was; nothing written
    Unchanged(UserRecord),
    Updated {
        before: UserRecord,
        after: UserRecord,
    },
}

fn cas_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(5)
        .max_delay(Duration::from_millis(200))
        .map(jitter)
        .take(MAX_CAS_RETRIES)
}

/// Read the current row, ask `decide` for the next state and commit it atomically.
///
/// `decide` sees the freshest stored record on every attempt and returns `None` to leave it
/// alone. Invariants are checked before each write. Version conflicts are retried with
/// jittered backoff; anything else is returned as is.
pub async fn update_with<F>(
    store: &dyn UserStore,
    identity: &str,
    decide: F,
) -> BillingResult<UpdateOutcome>
where
    F: Fn(&UserRecord) -> BillingResult<Option<UserRecord>> + Send + Sync,
{
    let decide = &decide;
    let attempt = || async move {
        let Some(current) = store.get(identity).await? else {
            return Ok(UpdateOutcome::Missing);
        };

        let Some(mut next) = decide(&current)? else {
            return Ok(UpdateOutcome::Unchanged(current));
        };
        next.version = current.version;
        if next == current {
            return Ok(UpdateOutcome::Unchanged(current));
        }

        invariants::check_transition(&current, &next)?;

        match store.compare_and_swap(&next).await? {
            Some(after) => Ok(UpdateOutcome::Updated {
                before: current,
                after,
            }),
            None => {
                tracing::debug!(identity, version = current.version, "Write conflict, retrying");
                Err(BillingError::WriteConflict(identity.to_string()))
            }
        }
    };

    RetryIf::start(cas_backoff(), attempt, |err: &BillingError| {
        matches!(err, BillingError::WriteConflict(_))
    })
    .await
}

/// Apply a partial update to an existing record.
pub async fn update(
    store: &dyn UserStore,
    identity: &str,
    patch: &UserPatch,
) -> BillingResult<UpdateOutcome> {
    update_with(store, identity, |current| Ok(Some(patch.apply(current)))).await
}

/// Create `record` after checking it against the per-row invariants.
pub async fn create_checked(store: &dyn UserStore, record: &UserRecord) -> BillingResult<UserRecord> {
    invariants::check_record(record)?;
    store.create(record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryUserStore::new();
        let first = store
            .create(&UserRecord::new_free("U1", "Aki", now()))
            .await
            .unwrap();
        let second = store
            .create(&UserRecord::new_free("U1", "Someone else", now()))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.display_name, "Aki");
    }

    #[tokio::test]
    async fn test_update_missing_identity() {
        let store = InMemoryUserStore::new();
        let outcome = update(&store, "nobody", &UserPatch::default()).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Missing);
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let store = InMemoryUserStore::new();
        store
            .create(&UserRecord::new_free("U1", "", now()))
            .await
            .unwrap();

        let patch = UserPatch {
            usage_count: Some(3),
            ..Default::default()
        };
        let outcome = update(&store, "U1", &patch).await.unwrap();
        let UpdateOutcome::Updated { before, after } = outcome else {
            panic!("expected an update");
        };
        assert_eq!(before.version, 0);
        assert_eq!(after.version, 1);
        assert_eq!(after.usage_count, 3);
    }

    #[tokio::test]
    async fn test_noop_patch_does_not_write() {
        let store = InMemoryUserStore::new();
        store
            .create(&UserRecord::new_free("U1", "", now()))
            .await
            .unwrap();
        let outcome = update(&store, "U1", &UserPatch::default()).await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Unchanged(ref r) if r.version == 0));
    }

    #[tokio::test]
    async fn test_invariant_refuses_paid_without_customer() {
        let store = InMemoryUserStore::new();
        store
            .create(&UserRecord::new_free("U1", "", now()))
            .await
            .unwrap();
        let patch = UserPatch {
            plan: Some(PlanTier::Monthly),
            ..Default::default()
        };
        let err = update(&store, "U1", &patch).await.unwrap_err();
        assert!(matches!(err, BillingError::InvariantViolation { .. }));
        assert_eq!(store.get("U1").await.unwrap().unwrap().plan, PlanTier::Free);
    }

    #[tokio::test]
    async fn test_create_checked_refuses_paid_without_customer() {
        let store = InMemoryUserStore::new();
        let mut record = UserRecord::new_free("U1", "", now());
        record.plan = PlanTier::Yearly;
        assert!(create_checked(&store, &record).await.is_err());
        assert!(store.get("U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_is_retried_against_fresh_state() {
        let store = InMemoryUserStore::new();
        store
            .create(&UserRecord::new_free("U1", "", now()))
            .await
            .unwrap();

        // The first decision races with a concurrent writer.
        let calls = AtomicUsize::new(0);
        let outcome = update_with(&store, "U1", |current| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut bumped = current.clone();
                bumped.usage_count += 5;
                store.force_put(bumped);
            }
            let mut next = current.clone();
            next.usage_count += 1;
            Ok(Some(next))
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match outcome {
            UpdateOutcome::Updated { after, .. } => assert_eq!(after.usage_count, 6),
            other => panic!("expected an update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryUserStore::new());
        store
            .create(&UserRecord::new_free("U1", "", now()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                update_with(store.as_ref(), "U1", |current| {
                    let mut next = current.clone();
                    next.usage_count += 1;
                    Ok(Some(next))
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.get("U1").await.unwrap().unwrap().usage_count, 4);
    }
}
