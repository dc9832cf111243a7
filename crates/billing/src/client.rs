//! Stripe client and configuration

use std::collections::HashMap;

use async_trait::async_trait;
use quotagate_shared::PlanTier;
use stripe::{
    BillingPortalSession, CancelSubscription, CheckoutSession, CheckoutSessionMode,
    CreateBillingPortalSession, CreateCheckoutSession, CreateCheckoutSessionLineItems, CustomerId,
    ListSubscriptions, Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};
use crate::payments::{PaymentProvider, SubscriptionSummary};
use crate::plans::{PlanResolver, PriceIds};

/// Checkout metadata key carrying the messaging identity
pub const IDENTITY_METADATA_KEY: &str = "lineUserId";
/// Checkout metadata key carrying the requested tier
pub const PLAN_METADATA_KEY: &str = "plan";

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub prices: PriceIds,
    /// Public base URL for checkout success/cancel pages and the portal return URL
    pub app_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            prices: PriceIds {
                monthly: required("STRIPE_PRICE_MONTHLY")?,
                yearly: required("STRIPE_PRICE_YEARLY")?,
            },
            app_url: required("APP_URL")?.trim_end_matches('/').to_string(),
        })
    }

    pub fn success_url(&self) -> String {
        format!("{}/success?session_id={{CHECKOUT_SESSION_ID}}", self.app_url)
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/cancel", self.app_url)
    }
}

fn required(key: &str) -> BillingResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} is not set", key)))
}

/// Stripe API wrapper implementing [`PaymentProvider`]
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
    resolver: PlanResolver,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            resolver: PlanResolver::new(config.prices.clone()),
            config,
        }
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidInput(format!("customer id {}: {}", customer_id, e)))
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
    subscription_id.parse::<SubscriptionId>().map_err(|e| {
        BillingError::InvalidInput(format!("subscription id {}: {}", subscription_id, e))
    })
}

pub(crate) fn summarize(subscription: Subscription) -> SubscriptionSummary {
    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    SubscriptionSummary {
        id: subscription.id.to_string(),
        customer_id: subscription.customer.id().to_string(),
        price_id,
        status: subscription.status.into(),
        created: subscription.created,
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_url(
        &self,
        identity: &str,
        plan: PlanTier,
        customer_id: Option<&str>,
    ) -> BillingResult<String> {
        let price = self.resolver.price_for(plan).ok_or_else(|| {
            BillingError::InvalidInput(format!("plan {} cannot be purchased", plan))
        })?;
        let success_url = self.config.success_url();
        let cancel_url = self.config.cancel_url();

        let mut metadata = HashMap::new();
        metadata.insert(IDENTITY_METADATA_KEY.to_string(), identity.to_string());
        metadata.insert(PLAN_METADATA_KEY.to_string(), plan.as_str().to_string());

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.client_reference_id = Some(identity);
        params.metadata = Some(metadata);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        if let Some(customer_id) = customer_id {
            params.customer = Some(parse_customer_id(customer_id)?);
        }

        let session = CheckoutSession::create(&self.inner, params).await?;
        tracing::info!(
            identity,
            plan = %plan,
            session_id = %session.id,
            "Created checkout session"
        );

        session
            .url
            .ok_or_else(|| BillingError::StripeApi("checkout session has no url".to_string()))
    }

    async fn create_portal_url(&self, customer_id: &str) -> BillingResult<String> {
        let mut params = CreateBillingPortalSession::new(parse_customer_id(customer_id)?);
        params.return_url = Some(&self.config.app_url);

        let session = BillingPortalSession::create(&self.inner, params).await?;
        tracing::info!(customer_id, "Created billing portal session");
        Ok(session.url)
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<SubscriptionSummary>> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(parse_customer_id(customer_id)?);
        params.limit = Some(100);

        let subscriptions = Subscription::list(&self.inner, &params).await?;
        Ok(subscriptions
            .data
            .into_iter()
            .map(summarize)
            .filter(|s| s.status.is_active())
            .collect())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSummary> {
        let id = parse_subscription_id(subscription_id)?;
        let subscription = Subscription::retrieve(&self.inner, &id, &[]).await?;
        Ok(summarize(subscription))
    }

    async fn cancel_subscription(&self, subscription_id: &str, prorate: bool) -> BillingResult<()> {
        let id = parse_subscription_id(subscription_id)?;
        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: Some(prorate),
            prorate: Some(prorate),
        };

        Subscription::cancel(&self.inner, &id, params).await?;
        tracing::info!(subscription_id, prorate, "Cancelled subscription");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 5] = [
        "STRIPE_SECRET_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "STRIPE_PRICE_MONTHLY",
        "STRIPE_PRICE_YEARLY",
        "APP_URL",
    ];

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_abc");
        std::env::set_var("STRIPE_PRICE_MONTHLY", "price_m");
        std::env::set_var("STRIPE_PRICE_YEARLY", "price_y");
        std::env::set_var("APP_URL", "https://bot.example.com/");

        let config = StripeConfig::from_env().unwrap();
        for key in KEYS {
            std::env::remove_var(key);
        }

        assert_eq!(config.prices.monthly, "price_m");
        assert_eq!(config.app_url, "https://bot.example.com");
        assert_eq!(
            config.success_url(),
            "https://bot.example.com/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(config.cancel_url(), "https://bot.example.com/cancel");
    }

    #[test]
    #[serial]
    fn test_config_requires_secret_key() {
        for key in KEYS {
            std::env::remove_var(key);
        }
        let err = StripeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("STRIPE_SECRET_KEY"));
    }
}
