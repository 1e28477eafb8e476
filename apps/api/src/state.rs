use std::sync::Arc;
use std::time::Duration;

use crate::adapters::AdapterRegistry;
use crate::metrics::Metrics;
use crate::pipeline::Processor;
use crate::reliability::rate_limit::RateLimiter;
use crate::reliability::signature::SignatureVerifier;
use crate::shared_store::SharedStore;
use crate::store::PipelineStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    /// Rate-limit windows, counters, state tokens and idempotency keys.
    pub shared: Arc<dyn SharedStore>,
    pub processor: Arc<Processor>,
    pub adapters: AdapterRegistry,
    pub rate_limiter: RateLimiter,
    pub metrics: Metrics,
    /// `None` when the platform's secret is not configured; every request is then rejected.
    pub slack_verifier: Option<SignatureVerifier>,
    pub mail_verifier: Option<SignatureVerifier>,
    pub event_dedup_ttl: Duration,
}
