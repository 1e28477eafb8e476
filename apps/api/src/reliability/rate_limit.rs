//! Per-identifier sliding request windows on top of the shared store.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use tracing::warn;

use crate::errors::AppError;
use crate::shared_store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPreset {
    pub name: &'static str,
    pub max_requests: u32,
    pub window: Duration,
}

pub const WEBHOOK: RateLimitPreset = RateLimitPreset {
    name: "webhook",
    max_requests: 100,
    window: Duration::from_secs(60),
};

pub const API: RateLimitPreset = RateLimitPreset {
    name: "api",
    max_requests: 60,
    window: Duration::from_secs(60),
};

pub const AUTH: RateLimitPreset = RateLimitPreset {
    name: "auth",
    max_requests: 5,
    window: Duration::from_secs(15 * 60),
};

// Reads are cheap and idempotent, writes fan out to external services.
pub const READ: RateLimitPreset = RateLimitPreset {
    name: "read",
    max_requests: 120,
    window: Duration::from_secs(60),
};

pub const WRITE: RateLimitPreset = RateLimitPreset {
    name: "write",
    max_requests: 30,
    window: Duration::from_secs(60),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub resets_in: Duration,
}

impl RateLimitDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("X-RateLimit-Limit", HeaderValue::from(self.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from(self.remaining));
    }

    fn retry_after_secs(&self) -> u64 {
        let secs = self.resets_in.as_secs();
        if self.resets_in.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Counts one request for `identifier` under `preset` and reports the window state.
    pub async fn check(
        &self,
        preset: RateLimitPreset,
        identifier: &str,
    ) -> anyhow::Result<RateLimitDecision> {
        let key = format!("{}:{}", preset.name, identifier);
        let hit = self
            .store
            .hit_window(&key, preset.window, preset.max_requests)
            .await?;
        Ok(RateLimitDecision {
            allowed: hit.count <= preset.max_requests,
            limit: preset.max_requests,
            remaining: preset.max_requests.saturating_sub(hit.count),
            resets_in: hit.resets_in,
        })
    }

    /// Like [`check`](Self::check) but turns a rejection into `AppError::RateLimited`.
    /// An unreachable store admits the request.
    pub async fn enforce(
        &self,
        preset: RateLimitPreset,
        identifier: &str,
    ) -> Result<RateLimitDecision, AppError> {
        let decision = match self.check(preset, identifier).await {
            Ok(d) => d,
            Err(e) => {
                warn!(preset = preset.name, "Rate limit store unavailable, admitting request: {e}");
                return Ok(RateLimitDecision {
                    allowed: true,
                    limit: preset.max_requests,
                    remaining: preset.max_requests,
                    resets_in: preset.window,
                });
            }
        };

        if !decision.allowed {
            warn!(preset = preset.name, identifier, "Rate limit exceeded");
            return Err(AppError::RateLimited {
                limit: decision.limit,
                retry_after_secs: decision.retry_after_secs(),
            });
        }
        Ok(decision)
    }
}

/// Best-effort client identity from proxy headers.
pub fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}
