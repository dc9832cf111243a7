//! Domain types shared by the API server, the billing core and the worker.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Subscription plan tier attached to a messaging identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Monthly,
    Yearly,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Monthly => "monthly",
            PlanTier::Yearly => "yearly",
        }
    }

    /// Monthly and Yearly are billed through the payment provider.
    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }

    /// The paid tier a subscriber would switch to from this one.
    pub fn alternate_paid(&self) -> Option<PlanTier> {
        match self {
            PlanTier::Free => None,
            PlanTier::Monthly => Some(PlanTier::Yearly),
            PlanTier::Yearly => Some(PlanTier::Monthly),
        }
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan tier: {0}")]
pub struct UnknownPlanTier(pub String);

impl std::str::FromStr for PlanTier {
    type Err = UnknownPlanTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "monthly" => Ok(PlanTier::Monthly),
            "yearly" | "annual" => Ok(PlanTier::Yearly),
            other => Err(UnknownPlanTier(other.to_string())),
        }
    }
}

/// Billing state for one messaging identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub identity: String,
    pub display_name: String,
    pub plan: PlanTier,
    pub usage_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_used_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_started_at: Option<OffsetDateTime>,
    pub payment_customer_id: Option<String>,
    /// Provider subscription currently backing a paid plan
    pub payment_subscription_id: Option<String>,
    pub conversation_token: Option<String>,
    /// Bumped on every successful write; used for compare-and-swap
    pub version: i64,
}

impl UserRecord {
    /// A brand new Free record with no usage.
    pub fn new_free(
        identity: impl Into<String>,
        display_name: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            plan: PlanTier::Free,
            usage_count: 0,
            last_used_at: now,
            subscription_started_at: None,
            payment_customer_id: None,
            payment_subscription_id: None,
            conversation_token: None,
            version: 0,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.plan.is_paid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_tier_round_trip_strings() {
        for tier in [PlanTier::Free, PlanTier::Monthly, PlanTier::Yearly] {
            assert_eq!(tier.as_str().parse::<PlanTier>().unwrap(), tier);
        }
        assert_eq!("Annual".parse::<PlanTier>().unwrap(), PlanTier::Yearly);
        assert!("premium".parse::<PlanTier>().is_err());
    }

    #[test]
    fn test_alternate_paid_tier() {
        assert_eq!(PlanTier::Free.alternate_paid(), None);
        assert_eq!(PlanTier::Monthly.alternate_paid(), Some(PlanTier::Yearly));
        assert_eq!(PlanTier::Yearly.alternate_paid(), Some(PlanTier::Monthly));
    }

    #[test]
    fn test_new_free_record() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let record = UserRecord::new_free("U123", "Aki", now);
        assert_eq!(record.plan, PlanTier::Free);
        assert_eq!(record.usage_count, 0);
        assert!(record.payment_customer_id.is_none());
        assert!(!record.is_paid());
    }

    #[test]
    fn test_record_serializes_plan_lowercase() {
        let record = UserRecord::new_free("U1", "", OffsetDateTime::UNIX_EPOCH);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"plan\":\"free\""));
    }
}
