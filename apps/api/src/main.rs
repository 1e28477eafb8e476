mod adapters;
mod analysis;
mod config;
mod db;
mod errors;
mod extractor;
mod llm_client;
mod metrics;
mod models;
mod pipeline;
mod reliability;
mod routes;
mod shared_store;
mod state;
mod store;
mod tasks;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::adapters::{AdapterRegistry, FigmaAdapter, SlackAdapter};
use crate::analysis::LlmAnalyzer;
use crate::config::Config;
use crate::db::create_pool;
use crate::extractor::{ContentExtractor, HttpRedirectResolver};
use crate::llm_client::LlmClient;
use crate::metrics::Metrics;
use crate::pipeline::{Processor, ProcessorOptions};
use crate::reliability::rate_limit::RateLimiter;
use crate::reliability::signature::SignatureVerifier;
use crate::routes::build_router;
use crate::shared_store::{MemorySharedStore, RedisSharedStore, SharedStore};
use crate::state::AppState;
use crate::store::{MemoryPipelineStore, PgPipelineStore, PipelineStore};
use crate::tasks::NotionTaskService;

/// How long a delivered event id is remembered.
const EVENT_DEDUP_TTL: Duration = Duration::from_secs(10 * 60);
/// Upper bound for any single platform or task-service call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting threadwise v{}", env!("CARGO_PKG_VERSION"));

    // Pipeline records: PostgreSQL, or memory for a single local instance
    let store: Arc<dyn PipelineStore> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, config.database_max_connections).await?;
            Arc::new(PgPipelineStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, pipeline records are kept in memory");
            Arc::new(MemoryPipelineStore::new())
        }
    };

    // Shared state: Redis, or memory when only one instance runs
    let shared: Arc<dyn SharedStore> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            Arc::new(RedisSharedStore::connect(&client).await?)
        }
        None => {
            warn!("REDIS_URL not set, rate limits and counters are per-process; do not scale out");
            Arc::new(MemorySharedStore::new())
        }
    };
    let metrics = Metrics::new(shared.clone());

    let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

    // Mail extraction: redirects are resolved with their own short timeout
    let resolver = Arc::new(HttpRedirectResolver::new(config.redirect_timeout)?);
    let extractor = Arc::new(ContentExtractor::new(
        resolver,
        &config.bot_handle,
        config.fuzzy_match_threshold,
    ));

    let mut slack = SlackAdapter::new(http.clone());
    if let Some(base) = &config.slack_api_base {
        slack = slack.with_api_base(base);
    }
    let mut figma = FigmaAdapter::new(http.clone(), extractor);
    if let Some(base) = &config.figma_api_base {
        figma = figma.with_api_base(base);
    }
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(slack)).register(Arc::new(figma));
    info!("Source adapters registered: {:?}", adapters.names());

    let llm = LlmClient::new(config.anthropic_api_key.clone())?;
    info!("LLM client initialized (model: {})", llm_client::MODEL);

    let processor = Processor::new(
        store.clone(),
        adapters.clone(),
        Arc::new(LlmAnalyzer::new(llm)),
        Arc::new(NotionTaskService::new(http)),
        metrics.clone(),
        ProcessorOptions {
            reuse_thread_on_retry: config.reuse_thread_on_retry,
        },
    );

    let verifier = |secret: &Option<String>, name: &str| {
        if secret.is_none() {
            warn!("{name} not set, its webhook will reject every request");
        }
        secret
            .as_deref()
            .map(|s| SignatureVerifier::new(s, config.signature_tolerance))
    };

    // Build app state
    let state = AppState {
        store,
        shared: shared.clone(),
        processor: Arc::new(processor),
        adapters,
        rate_limiter: RateLimiter::new(shared),
        metrics,
        slack_verifier: verifier(&config.slack_signing_secret, "SLACK_SIGNING_SECRET"),
        mail_verifier: verifier(&config.mailgun_signing_key, "MAILGUN_SIGNING_KEY"),
        event_dedup_ttl: EVENT_DEDUP_TTL,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
