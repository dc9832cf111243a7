// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Quotagate API Server
//!
//! Serves the LINE and Stripe webhooks and the plan landing page endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use quotagate_api::{create_router, AppState, Config, DifyClient, LineClient, Renderer};
use quotagate_billing::{
    BillingConfig, PgUserStore, PlanResolver, ReconciliationEngine, StripeClient, StripeConfig,
    StripeWebhookAdapter,
};
use quotagate_shared::{create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Dify blocking answers can take a while.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,quotagate_api=debug,quotagate_billing=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting Quotagate API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let billing_config = BillingConfig::from_env()?;
    let stripe_config = StripeConfig::from_env()?;
    tracing::info!(
        quota_limit = billing_config.quota_limit,
        reset_day = billing_config.reset.day,
        time_zone = %billing_config.reset.time_zone,
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
    let line = Arc::new(LineClient::new(
        http.clone(),
        &config.line_api_base,
        &config.line_channel_access_token,
    ));
    let dify = Arc::new(DifyClient::new(
        http,
        &config.dify_api_url,
        &config.dify_api_key,
    ));

    let resolver = PlanResolver::new(stripe_config.prices.clone());
    let stripe_webhooks = StripeWebhookAdapter::new(stripe_config.webhook_secret.clone());
    let payments = Arc::new(StripeClient::new(stripe_config));
    let store = Arc::new(PgUserStore::new(pool, billing_config.store_timeout));

    let engine = Arc::new(ReconciliationEngine::new(
        store,
        payments,
        dify,
        line.clone(),
        resolver,
        &billing_config,
    ));

    let state = AppState::new(
        engine,
        stripe_webhooks,
        line,
        Renderer::new(config.upgrade_page_url.clone()),
        &config.line_channel_secret,
    );

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
