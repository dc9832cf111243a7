//! Checkout, portal and smart-redirect routes for the plan landing page

use axum::{body::Bytes, extract::State, Json};
use quotagate_billing::RedirectDecision;
use quotagate_shared::PlanTier;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    render::{FREE_PLAN_NOTICE, PORTAL_FAILED},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkRequest {
    #[serde(default)]
    line_user_id: Option<String>,
    #[serde(default)]
    plan: Option<String>,
}

/// Identity and requested tier from a `{lineUserId, plan?}` body.
fn parse_request(body: &[u8]) -> ApiResult<(String, Option<PlanTier>)> {
    let request: LinkRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LinkRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|_| ApiError::Validation("Invalid request body".to_string()))?
    };

    let identity = request
        .line_user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("LINE user ID is required".to_string()))?;

    let plan = match request.plan.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match raw.parse::<PlanTier>() {
            Ok(plan) if plan.is_paid() => Some(plan),
            _ => return Err(ApiError::Validation(format!("Unknown plan: {}", raw))),
        },
    };

    Ok((identity, plan))
}

pub async fn checkout(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let (identity, plan) = parse_request(&body)?;
    let url = state
        .engine
        .checkout_link(&identity, plan.unwrap_or(PlanTier::Monthly))
        .await?;
    Ok(Json(json!({ "url": url })))
}

pub async fn portal(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let (identity, _) = parse_request(&body)?;

    if state.engine.store().get(&identity).await?.is_none() {
        return Err(ApiError::NotFound("ユーザーが見つかりません".to_string()));
    }

    match state.engine.portal_link(&identity).await? {
        Some(url) => Ok(Json(json!({ "url": url }))),
        None => Ok(Json(json!({ "message": FREE_PLAN_NOTICE }))),
    }
}

pub async fn smart_redirect(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let (identity, plan) = parse_request(&body)?;

    let response = match state.engine.smart_redirect(&identity, plan).await? {
        RedirectDecision::Checkout { url } => json!({
            "url": url,
            "action": "checkout",
            "message": "有料プランへアップグレード"
        }),
        RedirectDecision::Portal { url } => json!({
            "url": url,
            "action": "portal",
            "message": "契約管理ページへ"
        }),
        RedirectDecision::PortalUnavailable => json!({ "message": PORTAL_FAILED }),
    };
    Ok(Json(response))
}
