//! HTTP routes

pub mod billing;
pub mod line_webhook;
pub mod stripe_webhook;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/line/webhook", post(line_webhook::handle))
        .route("/stripe/webhook", post(stripe_webhook::handle))
        .route("/billing/checkout", post(billing::checkout))
        .route("/billing/portal", post(billing::portal))
        .route("/billing/redirect", post(billing::smart_redirect))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
