//! Application state

use std::sync::Arc;

use quotagate_billing::{ReconciliationEngine, StripeWebhookAdapter};

use crate::{line::ChatTransport, render::Renderer};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub stripe_webhooks: StripeWebhookAdapter,
    /// Outbound chat channel for replies and pushes
    pub chat: Arc<dyn ChatTransport>,
    pub renderer: Renderer,
    pub line_channel_secret: Arc<str>,
}

impl AppState {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        stripe_webhooks: StripeWebhookAdapter,
        chat: Arc<dyn ChatTransport>,
        renderer: Renderer,
        line_channel_secret: &str,
    ) -> Self {
        Self {
            engine,
            stripe_webhooks,
            chat,
            renderer,
            line_channel_secret: Arc::from(line_channel_secret),
        }
    }
}
