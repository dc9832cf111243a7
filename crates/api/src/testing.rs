//! Router test fixtures
#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response, Router};
use quotagate_billing::{
    mock::{MockAnswerBackend, MockPaymentProvider, StaticProfiles},
    BillingConfig, InMemoryUserStore, PlanResolver, PriceIds, ReconciliationEngine,
    StripeWebhookAdapter,
};
use tower::ServiceExt;

use crate::{
    error::ApiResult,
    line::{ChatTransport, LineMessage},
    render::Renderer,
    routes::create_router,
    state::AppState,
};

pub const LINE_SECRET: &str = "line-channel-secret";
pub const STRIPE_SECRET: &str = "whsec_test_secret";
pub const MONTHLY: &str = "price_monthly";
pub const YEARLY: &str = "price_yearly";

/// Chat transport that records outgoing messages
#[derive(Default)]
pub struct RecordingTransport {
    pub replies: Mutex<Vec<(String, Vec<LineMessage>)>>,
    pub pushes: Mutex<Vec<(String, Vec<LineMessage>)>>,
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn reply(&self, reply_token: &str, messages: Vec<LineMessage>) -> ApiResult<()> {
        self.replies
            .lock()
            .unwrap()
            .push((reply_token.to_string(), messages));
        Ok(())
    }

    async fn push(&self, to: &str, messages: Vec<LineMessage>) -> ApiResult<()> {
        self.pushes.lock().unwrap().push((to.to_string(), messages));
        Ok(())
    }
}

pub struct TestApp {
    pub store: Arc<InMemoryUserStore>,
    pub payments: Arc<MockPaymentProvider>,
    pub answers: Arc<MockAnswerBackend>,
    pub transport: Arc<RecordingTransport>,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryUserStore::new());
        let payments = Arc::new(MockPaymentProvider::new());
        let answers = Arc::new(MockAnswerBackend::new());
        let transport = Arc::new(RecordingTransport::default());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            payments.clone(),
            answers.clone(),
            Arc::new(StaticProfiles::new().with("U1", "Aki")),
            PlanResolver::new(PriceIds {
                monthly: MONTHLY.to_string(),
                yearly: YEARLY.to_string(),
            }),
            &BillingConfig::default(),
        ));
        let state = AppState::new(
            engine,
            StripeWebhookAdapter::new(STRIPE_SECRET),
            transport.clone(),
            Renderer::new("https://liff.line.me/2000000000-abc"),
            LINE_SECRET,
        );

        Self {
            store,
            payments,
            answers,
            transport,
            router: create_router(state),
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub fn replies(&self) -> Vec<(String, Vec<LineMessage>)> {
        self.transport.replies.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<(String, Vec<LineMessage>)> {
        self.transport.pushes.lock().unwrap().clone()
    }
}

pub async fn json_body(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
