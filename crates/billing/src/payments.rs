//! Payment provider boundary

use async_trait::async_trait;
use quotagate_shared::PlanTier;
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;

/// Provider-side subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Canceled,
    Paused,
}

impl SubscriptionStatus {
    /// Statuses that entitle the customer to a paid plan.
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

impl From<stripe::SubscriptionStatus> for SubscriptionStatus {
    fn from(status: stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
            stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
            stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
            stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        }
    }
}

/// The parts of a provider subscription the engine reasons about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSummary {
    pub id: String,
    pub customer_id: String,
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    /// Unix seconds
    pub created: i64,
}

/// Checkout, portal and subscription management at the payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Hosted checkout page for `plan`. Existing customers are reused when known.
    async fn create_checkout_url(
        &self,
        identity: &str,
        plan: PlanTier,
        customer_id: Option<&str>,
    ) -> BillingResult<String>;

    /// Self-service billing portal for an existing customer.
    async fn create_portal_url(&self, customer_id: &str) -> BillingResult<String>;

    /// Active or trialing subscriptions for a customer.
    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<SubscriptionSummary>>;

    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSummary>;

    /// Cancel immediately, optionally prorating the unused period.
    async fn cancel_subscription(&self, subscription_id: &str, prorate: bool) -> BillingResult<()>;
}
