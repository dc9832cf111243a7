// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Quotagate API Library
//!
//! HTTP surface of the gateway: LINE and Stripe webhooks, the plan landing page endpoints,
//! and the LINE and Dify clients the reconciliation engine talks through.

pub mod config;
pub mod dify;
pub mod error;
pub mod line;
pub mod render;
pub mod routes;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use dify::DifyClient;
pub use error::{ApiError, ApiResult};
pub use line::{ChatTransport, LineClient};
pub use render::Renderer;
pub use routes::create_router;
pub use state::AppState;
