//! Stripe webhook route
//!
//! Validation failures answer 400, transient failures 5xx so Stripe redelivers, and
//! dropped or unhandled events 200.

use axum::{extract::State, http::HeaderMap, Json};
use quotagate_billing::Disposition;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let req_id = Uuid::new_v4();

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("Missing Stripe-Signature header".to_string()))?;

    let verified = state
        .stripe_webhooks
        .verify_and_parse(&body, signature)
        .inspect_err(|e| {
            tracing::warn!(%req_id, dependency = "stripe", error = %e, "Rejected Stripe webhook");
        })?;

    let Some(event) = verified.event else {
        return Ok(Json(json!({"received": true, "handled": false})));
    };

    let outcome = state.engine.handle(event).await.inspect_err(|e| {
        tracing::error!(
            %req_id,
            event_id = %verified.id,
            event_type = %verified.event_type,
            error = %e,
            kind = ?e.kind(),
            "Stripe webhook processing failed"
        );
    })?;

    let disposition = match &outcome.disposition {
        Disposition::Applied => "applied".to_string(),
        Disposition::Unchanged => "unchanged".to_string(),
        Disposition::Dropped(reason) => {
            tracing::info!(
                %req_id,
                event_id = %verified.id,
                event_type = %verified.event_type,
                reason = ?reason,
                "Stripe webhook dropped"
            );
            format!("dropped:{:?}", reason)
        }
    };

    Ok(Json(json!({
        "received": true,
        "handled": true,
        "disposition": disposition
    })))
}
