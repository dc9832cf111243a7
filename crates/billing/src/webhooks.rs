//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header and translates the handful of event types the
//! engine cares about into [`BillingEvent`]s.
//!
//! Payloads are decoded into the minimal shapes below rather than `stripe::Event`, whose
//! generated types reject payloads from API versions newer than the crate.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::client::IDENTITY_METADATA_KEY;
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::payments::SubscriptionStatus;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// Check a `Stripe-Signature` header (`t=...,v1=...`) against the raw payload.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    customer: Option<String>,
    subscription: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    status: SubscriptionStatus,
    #[serde(default)]
    items: ItemList,
}

#[derive(Debug, Default, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    price: Option<PriceRef>,
}

#[derive(Debug, Deserialize)]
struct PriceRef {
    id: String,
}

/// A verified event, translated for the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEvent {
    pub id: String,
    pub event_type: String,
    /// `None` for event types the engine does not consume
    pub event: Option<BillingEvent>,
}

/// Stripe webhook adapter
#[derive(Clone)]
pub struct StripeWebhookAdapter {
    secret: String,
}

impl StripeWebhookAdapter {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify and translate a raw webhook request body.
    pub fn verify_and_parse(&self, payload: &str, signature: &str) -> BillingResult<VerifiedEvent> {
        self.verify_and_parse_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_and_parse_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<VerifiedEvent> {
        verify_signature(payload, signature, &self.secret, now)?;
        let verified = adapt(payload)?;
        tracing::info!(
            event_id = %verified.id,
            event_type = %verified.event_type,
            handled = verified.event.is_some(),
            "Verified Stripe webhook"
        );
        Ok(verified)
    }
}

fn payload_error(context: &str, err: impl std::fmt::Display) -> BillingError {
    BillingError::WebhookPayload(format!("{}: {}", context, err))
}

/// Translate a webhook body into an engine event.
pub fn adapt(payload: &str) -> BillingResult<VerifiedEvent> {
    let envelope: Envelope =
        serde_json::from_str(payload).map_err(|e| payload_error("event envelope", e))?;
    let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.created)
        .map_err(|e| payload_error("event created", e))?;

    let event = match envelope.event_type.as_str() {
        CHECKOUT_SESSION_COMPLETED => {
            let session: CheckoutSessionObject = serde_json::from_value(envelope.data.object)
                .map_err(|e| payload_error("checkout session", e))?;
            let customer_id = session.customer.ok_or_else(|| {
                BillingError::WebhookPayload("checkout session has no customer".to_string())
            })?;
            let identity = session
                .metadata
                .get(IDENTITY_METADATA_KEY)
                .cloned()
                .or(session.client_reference_id)
                .filter(|id| !id.is_empty());

            Some(BillingEvent::CheckoutCompleted {
                identity,
                customer_id,
                subscription_id: session.subscription,
                occurred_at,
            })
        }
        SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED => {
            let subscription = parse_subscription(envelope.data.object)?;
            let price_id = subscription
                .items
                .data
                .into_iter()
                .find_map(|item| item.price.map(|p| p.id));
            Some(BillingEvent::SubscriptionUpdated {
                customer_id: subscription.customer,
                subscription_id: subscription.id,
                status: subscription.status,
                price_id,
                occurred_at,
            })
        }
        SUBSCRIPTION_DELETED => {
            let subscription = parse_subscription(envelope.data.object)?;
            Some(BillingEvent::SubscriptionDeleted {
                customer_id: subscription.customer,
                subscription_id: subscription.id,
                occurred_at,
            })
        }
        other => {
            tracing::debug!(event_type = other, "Unhandled Stripe event type");
            None
        }
    };

    Ok(VerifiedEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        event,
    })
}

fn parse_subscription(object: serde_json::Value) -> BillingResult<SubscriptionObject> {
    serde_json::from_value(object).map_err(|e| payload_error("subscription", e))
}

/// Build a `Stripe-Signature` header for `payload`.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_735_689_600;

    fn subscription_event(event_type: &str, status: &str) -> String {
        serde_json::json!({
            "id": "evt_1",
            "object": "event",
            "type": event_type,
            "created": NOW,
            "data": { "object": {
                "id": "sub_1",
                "object": "subscription",
                "customer": "cus_1",
                "status": status,
                "created": NOW - 10,
                "items": { "object": "list", "data": [
                    { "id": "si_1", "price": { "id": "price_yearly" } }
                ]}
            }}
        })
        .to_string()
    }

    // =========================================================================
    // Signature verification
    // =========================================================================

    #[test]
    fn test_valid_signature_accepted() {
        let payload = subscription_event(SUBSCRIPTION_UPDATED, "active");
        let header = sign_payload(&payload, SECRET, NOW).unwrap();
        assert!(verify_signature(&payload, &header, SECRET, NOW + 30).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = subscription_event(SUBSCRIPTION_UPDATED, "active");
        let header = sign_payload(&payload, SECRET, NOW).unwrap();
        let tampered = payload.replace("cus_1", "cus_2");
        assert!(matches!(
            verify_signature(&tampered, &header, SECRET, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign_payload(payload, "whsec_other", NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let header = sign_payload(payload, SECRET, NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, NOW + 301).is_err());
        assert!(verify_signature(payload, &header, SECRET, NOW + 300).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("{}", "", SECRET, NOW).is_err());
        assert!(verify_signature("{}", "t=abc,v1=00", SECRET, NOW).is_err());
        assert!(verify_signature("{}", &format!("t={}", NOW), SECRET, NOW).is_err());
    }

    #[test]
    fn test_any_matching_v1_accepted() {
        let payload = "{}";
        let good = sign_payload(payload, SECRET, NOW).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1=deadbeef,v1={}", NOW, good_sig);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    // =========================================================================
    // Event translation
    // =========================================================================

    #[test]
    fn test_checkout_completed_translated() {
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": CHECKOUT_SESSION_COMPLETED,
            "created": NOW,
            "data": { "object": {
                "id": "cs_1",
                "object": "checkout.session",
                "customer": "cus_9",
                "subscription": "sub_9",
                "client_reference_id": null,
                "metadata": { "lineUserId": "U123", "plan": "monthly" }
            }}
        })
        .to_string();

        let verified = adapt(&payload).unwrap();
        assert_eq!(
            verified.event,
            Some(BillingEvent::CheckoutCompleted {
                identity: Some("U123".to_string()),
                customer_id: "cus_9".to_string(),
                subscription_id: Some("sub_9".to_string()),
                occurred_at: datetime!(2025-01-01 00:00 UTC),
            })
        );
    }

    #[test]
    fn test_checkout_without_metadata_falls_back_to_reference() {
        let payload = serde_json::json!({
            "id": "evt_3",
            "type": CHECKOUT_SESSION_COMPLETED,
            "created": NOW,
            "data": { "object": {
                "customer": "cus_9",
                "subscription": null,
                "client_reference_id": "U777",
                "metadata": {}
            }}
        })
        .to_string();
        let Some(BillingEvent::CheckoutCompleted { identity, .. }) = adapt(&payload).unwrap().event
        else {
            panic!("expected checkout event");
        };
        assert_eq!(identity.as_deref(), Some("U777"));
    }

    #[test]
    fn test_subscription_created_maps_to_update() {
        let verified = adapt(&subscription_event(SUBSCRIPTION_CREATED, "trialing")).unwrap();
        assert_eq!(
            verified.event,
            Some(BillingEvent::SubscriptionUpdated {
                customer_id: "cus_1".to_string(),
                subscription_id: "sub_1".to_string(),
                status: SubscriptionStatus::Trialing,
                price_id: Some("price_yearly".to_string()),
                occurred_at: datetime!(2025-01-01 00:00 UTC),
            })
        );
    }

    #[test]
    fn test_subscription_deleted_translated() {
        let verified = adapt(&subscription_event(SUBSCRIPTION_DELETED, "canceled")).unwrap();
        assert!(matches!(
            verified.event,
            Some(BillingEvent::SubscriptionDeleted { ref subscription_id, .. }) if subscription_id == "sub_1"
        ));
    }

    #[test]
    fn test_unhandled_type_is_ignored() {
        let payload = serde_json::json!({
            "id": "evt_4",
            "type": "invoice.paid",
            "created": NOW,
            "data": { "object": { "id": "in_1" } }
        })
        .to_string();
        let verified = adapt(&payload).unwrap();
        assert_eq!(verified.event_type, "invoice.paid");
        assert!(verified.event.is_none());
    }

    #[test]
    fn test_malformed_payload_is_validation_error() {
        let err = adapt("not json").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        let missing_customer = serde_json::json!({
            "id": "evt_5",
            "type": CHECKOUT_SESSION_COMPLETED,
            "created": NOW,
            "data": { "object": { "metadata": { "lineUserId": "U1" } } }
        })
        .to_string();
        assert!(matches!(
            adapt(&missing_customer),
            Err(BillingError::WebhookPayload(_))
        ));
    }

    #[test]
    fn test_adapter_verifies_before_parsing() {
        let adapter = StripeWebhookAdapter::new(SECRET);
        let payload = subscription_event(SUBSCRIPTION_UPDATED, "past_due");
        let header = sign_payload(&payload, SECRET, NOW).unwrap();

        let verified = adapter.verify_and_parse_at(&payload, &header, NOW).unwrap();
        assert!(matches!(
            verified.event,
            Some(BillingEvent::SubscriptionUpdated {
                status: SubscriptionStatus::PastDue,
                ..
            })
        ));

        assert!(adapter
            .verify_and_parse_at("{\"garbage\":true}", &header, NOW)
            .is_err());
    }
}
