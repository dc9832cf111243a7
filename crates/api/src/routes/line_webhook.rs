//! LINE webhook route

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use quotagate_billing::{ApologyReason, Disposition, Outcome, Reply};

use crate::{
    error::{ApiError, ApiResult},
    line::{self, InboundEvent, WebhookBody, SIGNATURE_HEADER},
    state::AppState,
};

/// Verify the delivery, then apply its events in order.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("Missing signature".to_string()))?;

    if !line::verify_signature(&body, signature, &state.line_channel_secret) {
        tracing::warn!(dependency = "line", "Rejected LINE webhook with invalid signature");
        return Err(ApiError::InvalidSignature);
    }

    let payload: WebhookBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid webhook body: {}", e)))?;

    for inbound in payload.events.into_iter().filter_map(line::adapt) {
        dispatch(&state, inbound).await;
    }

    Ok(StatusCode::OK)
}

async fn dispatch(state: &AppState, inbound: InboundEvent) {
    let InboundEvent {
        identity,
        reply_token,
        event,
    } = inbound;
    let event_kind = event.kind();

    let outcome = match state.engine.handle(event).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                identity = %identity,
                event_kind,
                error = %e,
                kind = ?e.kind(),
                "Chat event failed, sending apology"
            );
            Outcome::new(Disposition::Unchanged)
                .reply(Reply::Apology(ApologyReason::Unavailable))
        }
    };

    let replies = state.renderer.render_all(&outcome.replies);
    if let Some(token) = reply_token.filter(|_| !replies.is_empty()) {
        if let Err(e) = state.chat.reply(&token, replies).await {
            tracing::warn!(identity = %identity, event_kind, dependency = "line", error = %e, "Reply failed");
        }
    }

    let pushes = state.renderer.render_all(&outcome.notifications);
    if !pushes.is_empty() {
        if let Err(e) = state.chat.push(&identity, pushes).await {
            tracing::warn!(identity = %identity, event_kind, dependency = "line", error = %e, "Push failed");
        }
    }
}
