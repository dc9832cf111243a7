//! In-process collaborators for tests and local runs

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use quotagate_shared::PlanTier;

use crate::answers::{Answer, AnswerBackend, AnswerError, ProfileSource};
use crate::error::{BillingError, BillingResult};
use crate::payments::{PaymentProvider, SubscriptionStatus, SubscriptionSummary};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Checkout request captured by [`MockPaymentProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub identity: String,
    pub plan: PlanTier,
    pub customer_id: Option<String>,
}

/// Payment provider that keeps subscriptions in memory.
#[derive(Default)]
pub struct MockPaymentProvider {
    subscriptions: Mutex<Vec<SubscriptionSummary>>,
    checkouts: Mutex<Vec<CheckoutRequest>>,
    cancellations: Mutex<Vec<(String, bool)>>,
    fail_portal: Mutex<bool>,
    fail_list: Mutex<bool>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(
        &self,
        id: &str,
        customer_id: &str,
        price_id: &str,
        created: i64,
    ) -> SubscriptionSummary {
        let summary = SubscriptionSummary {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            price_id: Some(price_id.to_string()),
            status: SubscriptionStatus::Active,
            created,
        };
        locked(&self.subscriptions).push(summary.clone());
        summary
    }

    pub fn set_status(&self, subscription_id: &str, status: SubscriptionStatus) {
        for sub in locked(&self.subscriptions).iter_mut() {
            if sub.id == subscription_id {
                sub.status = status;
            }
        }
    }

    pub fn status_of(&self, subscription_id: &str) -> Option<SubscriptionStatus> {
        locked(&self.subscriptions)
            .iter()
            .find(|s| s.id == subscription_id)
            .map(|s| s.status)
    }

    /// `(subscription_id, prorate)` for every cancellation, in order
    pub fn cancellations(&self) -> Vec<(String, bool)> {
        locked(&self.cancellations).clone()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        locked(&self.checkouts).clone()
    }

    pub fn fail_portal(&self, fail: bool) {
        *locked(&self.fail_portal) = fail;
    }

    pub fn fail_list(&self, fail: bool) {
        *locked(&self.fail_list) = fail;
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_url(
        &self,
        identity: &str,
        plan: PlanTier,
        customer_id: Option<&str>,
    ) -> BillingResult<String> {
        if !plan.is_paid() {
            return Err(BillingError::InvalidInput(format!(
                "plan {} cannot be purchased",
                plan
            )));
        }
        locked(&self.checkouts).push(CheckoutRequest {
            identity: identity.to_string(),
            plan,
            customer_id: customer_id.map(str::to_string),
        });
        Ok(format!("https://checkout.test/{}/{}", identity, plan))
    }

    async fn create_portal_url(&self, customer_id: &str) -> BillingResult<String> {
        if *locked(&self.fail_portal) {
            return Err(BillingError::StripeApi("portal unavailable".to_string()));
        }
        Ok(format!("https://portal.test/{}", customer_id))
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<SubscriptionSummary>> {
        if *locked(&self.fail_list) {
            return Err(BillingError::StripeApi("list unavailable".to_string()));
        }
        Ok(locked(&self.subscriptions)
            .iter()
            .filter(|s| s.customer_id == customer_id && s.status.is_active())
            .cloned()
            .collect())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSummary> {
        locked(&self.subscriptions)
            .iter()
            .find(|s| s.id == subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::StripeApi(format!("No such subscription: {}", subscription_id))
            })
    }

    async fn cancel_subscription(&self, subscription_id: &str, prorate: bool) -> BillingResult<()> {
        self.set_status(subscription_id, SubscriptionStatus::Canceled);
        locked(&self.cancellations).push((subscription_id.to_string(), prorate));
        Ok(())
    }
}

/// Answer backend that echoes or replays queued responses.
#[derive(Default)]
pub struct MockAnswerBackend {
    queued: Mutex<VecDeque<Result<Answer, AnswerError>>>,
    calls: Mutex<Vec<(String, String, Option<String>)>>,
}

impl MockAnswerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call return `response` instead of the default echo.
    pub fn push_response(&self, response: Result<Answer, AnswerError>) {
        locked(&self.queued).push_back(response);
    }

    pub fn call_count(&self) -> usize {
        locked(&self.calls).len()
    }

    /// Conversation tokens passed on each call
    pub fn conversation_tokens(&self) -> Vec<Option<String>> {
        locked(&self.calls).iter().map(|c| c.2.clone()).collect()
    }
}

#[async_trait]
impl AnswerBackend for MockAnswerBackend {
    async fn ask(
        &self,
        message: &str,
        identity: &str,
        conversation_token: Option<&str>,
    ) -> Result<Answer, AnswerError> {
        locked(&self.calls).push((
            message.to_string(),
            identity.to_string(),
            conversation_token.map(str::to_string),
        ));

        if let Some(response) = locked(&self.queued).pop_front() {
            return response;
        }
        Ok(Answer {
            text: format!("answer: {}", message),
            conversation_token: Some(format!("conv-{}", identity)),
        })
    }
}

/// Fixed display names keyed by identity
#[derive(Default)]
pub struct StaticProfiles {
    names: HashMap<String, String>,
    fail: bool,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, identity: &str, display_name: &str) -> Self {
        self.names
            .insert(identity.to_string(), display_name.to_string());
        self
    }

    /// Every lookup fails
    pub fn failing() -> Self {
        Self {
            names: HashMap::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn display_name(&self, identity: &str) -> BillingResult<String> {
        if self.fail {
            return Err(BillingError::Upstream {
                dependency: "chat_profile",
                message: "profile lookup disabled".to_string(),
            });
        }
        Ok(self.names.get(identity).cloned().unwrap_or_default())
    }
}
