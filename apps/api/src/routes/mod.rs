pub mod discussions;
pub mod health;
pub mod sources;
pub mod webhooks;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::metrics::Counter;
use crate::reliability::rate_limit::{self, client_key, RateLimitDecision, RateLimitPreset};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let reads = Router::new()
        .route("/api/v1/discussions/:id", get(discussions::handle_get_discussion))
        .route(
            "/api/v1/discussions/:id/jobs",
            get(discussions::handle_list_jobs),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_reads));

    let writes = Router::new()
        .route(
            "/api/v1/discussions/:id/retry",
            post(discussions::handle_retry),
        )
        .route(
            "/api/v1/sources/:source_type/validate",
            post(sources::handle_validate),
        )
        .route(
            "/api/v1/sources/:source_type/test",
            post(sources::handle_test_connection),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_writes));

    let installs = Router::new()
        .route(
            "/api/v1/sources/:source_type/install",
            post(sources::handle_issue_install_state),
        )
        .route(
            "/api/v1/sources/:source_type/install/callback",
            get(sources::handle_install_callback),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_auth));

    let ops = Router::new()
        .route("/api/v1/metrics", get(handle_metrics))
        .route("/api/v1/sources", get(sources::handle_list_sources))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit_api));

    Router::new()
        .route("/health", get(health::health_handler))
        // Webhooks are limited per source inside the handlers.
        .route("/webhooks/slack", post(webhooks::handle_slack))
        .route("/webhooks/figma", post(webhooks::handle_figma))
        .merge(reads)
        .merge(writes)
        .merge(installs)
        .merge(ops)
        .with_state(state)
}

/// GET /api/v1/metrics
async fn handle_metrics(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let counters = state.metrics.snapshot().await?;
    Ok(Json(json!({ "counters": counters })))
}

/// Admits the request under `preset` or answers `429`, recording the rejection.
pub(crate) async fn admit(
    state: &AppState,
    preset: RateLimitPreset,
    identifier: &str,
) -> Result<RateLimitDecision, AppError> {
    let decision = state.rate_limiter.enforce(preset, identifier).await;
    if decision.is_err() {
        state.metrics.incr(Counter::RateLimited).await;
    }
    decision
}

async fn limited(
    state: AppState,
    preset: RateLimitPreset,
    headers: &HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let decision = admit(&state, preset, &client_key(headers)).await?;
    let mut response = next.run(request).await;
    decision.apply_headers(response.headers_mut());
    Ok(response)
}

async fn limit_reads(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    limited(state, rate_limit::READ, &headers, request, next).await
}

async fn limit_writes(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    limited(state, rate_limit::WRITE, &headers, request, next).await
}

async fn limit_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    limited(state, rate_limit::AUTH, &headers, request, next).await
}

async fn limit_api(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    limited(state, rate_limit::API, &headers, request, next).await
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPipelineStore;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_support::state(Arc::new(MemoryPipelineStore::new())));
        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_lists_all_counters_with_limit_headers() {
        let app = build_router(test_support::state(Arc::new(MemoryPipelineStore::new())));
        let response = app
            .oneshot(HttpRequest::get("/api/v1/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["X-RateLimit-Limit"],
            rate_limit::API.max_requests.to_string().as_str()
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["counters"]["jobs_completed"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_preset_rejects_past_budget() {
        let state = test_support::state(Arc::new(MemoryPipelineStore::new()));
        let app = build_router(state.clone());
        let call = || {
            HttpRequest::post("/api/v1/sources/slack/validate")
                .header("content-type", "application/json")
                .header("x-forwarded-for", "198.51.100.7")
                .body(Body::from("{}"))
                .unwrap()
        };
        for _ in 0..rate_limit::WRITE.max_requests {
            let response = app.clone().oneshot(call()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(call()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        assert!(response.headers().contains_key("Retry-After"));

        let counters = state.metrics.snapshot().await.unwrap();
        assert_eq!(counters["rate_limited"], 1);
    }
}
