//! In-process `UserStore` for tests and local runs

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use quotagate_shared::{PlanTier, UserRecord};

use super::UserStore;
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
pub struct InMemoryUserStore {
    records: Mutex<HashMap<String, UserRecord>>,
    reset_periods: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the backing database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All records, ordered by identity.
    pub fn snapshot(&self) -> Vec<UserRecord> {
        let Ok(records) = self.records.lock() else {
            return Vec::new();
        };
        let mut all: Vec<UserRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.identity.cmp(&b.identity));
        all
    }

    /// Overwrite a row without a version check, bumping its version.
    #[cfg(test)]
    pub(crate) fn force_put(&self, mut record: UserRecord) {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(&record.identity) {
            record.version = existing.version + 1;
        }
        records.insert(record.identity.clone(), record);
    }

    fn available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn records(&self) -> BillingResult<MutexGuard<'_, HashMap<String, UserRecord>>> {
        self.available()?;
        self.records
            .lock()
            .map_err(|_| BillingError::Internal("user record lock poisoned".into()))
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get(&self, identity: &str) -> BillingResult<Option<UserRecord>> {
        Ok(self.records()?.get(identity).cloned())
    }

    async fn create(&self, record: &UserRecord) -> BillingResult<UserRecord> {
        let mut records = self.records()?;
        let stored = records
            .entry(record.identity.clone())
            .or_insert_with(|| UserRecord {
                version: 0,
                ..record.clone()
            });
        Ok(stored.clone())
    }

    async fn compare_and_swap(&self, record: &UserRecord) -> BillingResult<Option<UserRecord>> {
        let mut records = self.records()?;
        match records.get_mut(&record.identity) {
            Some(stored) if stored.version == record.version => {
                *stored = UserRecord {
                    version: record.version + 1,
                    ..record.clone()
                };
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find_by_payment_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        Ok(self
            .records()?
            .values()
            .find(|r| r.payment_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn reset_all_free_usage(&self) -> BillingResult<u64> {
        let mut records = self.records()?;
        let mut touched = 0;
        for record in records.values_mut() {
            if record.plan == PlanTier::Free && record.usage_count > 0 {
                record.usage_count = 0;
                record.version += 1;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn claim_reset_period(&self, period: &str) -> BillingResult<bool> {
        self.available()?;
        let mut periods = self
            .reset_periods
            .lock()
            .map_err(|_| BillingError::Internal("reset period lock poisoned".into()))?;
        Ok(periods.insert(period.to_string()))
    }
}
