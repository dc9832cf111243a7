//! Free-tier quota gate

use quotagate_shared::UserRecord;
use time::OffsetDateTime;

/// Remaining-quota threshold at or below which a warning is pushed.
pub const LOW_QUOTA_THRESHOLD: u32 = 3;

/// Result of a gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    /// Record after consumption; identical to the input when denied
    pub record: UserRecord,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageGate {
    quota_limit: u32,
}

impl UsageGate {
    pub fn new(quota_limit: u32) -> Self {
        Self { quota_limit }
    }

    pub fn quota_limit(&self) -> u32 {
        self.quota_limit
    }

    /// Decide whether one more answer is permitted and compute the consumed record.
    pub fn check_and_consume(&self, record: &UserRecord, now: OffsetDateTime) -> GateDecision {
        if record.is_paid() {
            let mut next = record.clone();
            next.last_used_at = now;
            return GateDecision {
                allowed: true,
                record: next,
            };
        }

        if record.usage_count >= self.quota_limit {
            return GateDecision {
                allowed: false,
                record: record.clone(),
            };
        }

        let mut next = record.clone();
        next.usage_count += 1;
        next.last_used_at = now;
        GateDecision {
            allowed: true,
            record: next,
        }
    }

    /// Free answers left this period. Paid records report `None`.
    pub fn remaining(&self, record: &UserRecord) -> Option<u32> {
        if record.is_paid() {
            None
        } else {
            Some(self.quota_limit.saturating_sub(record.usage_count))
        }
    }

    pub fn should_warn(&self, record: &UserRecord) -> bool {
        matches!(self.remaining(record), Some(r) if r > 0 && r <= LOW_QUOTA_THRESHOLD)
    }
}
