//! Inbound webhooks. Every request is authenticated, rate limited and
//! de-duplicated before it reaches the pipeline.

use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::extractor::MailSignature;
use crate::metrics::Counter;
use crate::pipeline::ProcessOutcome;
use crate::reliability::rate_limit::{self, client_key, RateLimitDecision};
use crate::reliability::signature::SignatureError;
use crate::routes::admit;
use crate::state::AppState;

const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";

#[derive(Serialize)]
struct Processed {
    status: &'static str,
    #[serde(flatten)]
    outcome: ProcessOutcome,
}

/// POST /webhooks/slack
pub async fn handle_slack(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    state.metrics.incr(Counter::WebhooksReceived).await;

    let verified = state
        .slack_verifier
        .as_ref()
        .ok_or(SignatureError::Missing("signing secret"))
        .and_then(|v| {
            v.verify_chat_event(
                header(&headers, SLACK_TIMESTAMP_HEADER),
                header(&headers, SLACK_SIGNATURE_HEADER),
                &body,
                chrono::Utc::now().timestamp(),
            )
        });
    if let Err(e) = verified {
        return Err(reject(&state, "slack", e.into()).await);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let err = AppError::Validation(format!("body is not JSON: {e}"));
            return Err(reject(&state, "slack", err).await);
        }
    };

    if payload["type"] == "url_verification" {
        let challenge = payload["challenge"].clone();
        return Ok(Json(json!({ "challenge": challenge })).into_response());
    }

    let decision = admit(&state, rate_limit::WEBHOOK, &limit_key("slack", &headers)).await?;
    process(&state, "slack", &payload, slack_claim(&payload), decision).await
}

/// Dedup key for a Slack delivery. A mention arrives as both a `message`
/// and an `app_mention` event with distinct event ids, so the claim is
/// taken on the message itself and the event id is only a fallback.
fn slack_claim(payload: &Value) -> Option<String> {
    let event = &payload["event"];
    match (event["channel"].as_str(), event["ts"].as_str()) {
        (Some(channel), Some(ts)) => Some(format!("slack:msg:{channel}:{ts}")),
        _ => payload["event_id"]
            .as_str()
            .map(|id| format!("slack:event:{id}")),
    }
}

/// POST /webhooks/figma
///
/// Receives comment notifications forwarded by the inbound-mail provider.
pub async fn handle_figma(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    state.metrics.incr(Counter::WebhooksReceived).await;

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            let err = AppError::Validation(format!("body is not JSON: {e}"));
            return Err(reject(&state, "figma", err).await);
        }
    };

    let signature: Option<MailSignature> = serde_json::from_value(payload["signature"].clone()).ok();
    let verified = match (state.mail_verifier.as_ref(), signature.as_ref()) {
        (None, _) => Err(SignatureError::Missing("signing key")),
        (_, None) => Err(SignatureError::Missing("signature block")),
        (Some(v), Some(s)) => v.verify_mail_event(
            &s.timestamp,
            &s.token,
            &s.signature,
            chrono::Utc::now().timestamp(),
        ),
    };
    if let Err(e) = verified {
        return Err(reject(&state, "figma", e.into()).await);
    }

    let decision = admit(&state, rate_limit::WEBHOOK, &limit_key("figma", &headers)).await?;
    // The provider's token is unique per delivery.
    let claim = signature.map(|s| format!("figma:mail:{}", s.token));
    process(&state, "figma", &payload, claim, decision).await
}

async fn process(
    state: &AppState,
    source_type: &str,
    payload: &Value,
    claim: Option<String>,
    decision: RateLimitDecision,
) -> Result<Response, AppError> {
    if let Some(key) = &claim {
        match state.shared.claim_once(key, state.event_dedup_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                info!(source = source_type, key = %key, "Duplicate delivery acknowledged");
                return Ok(with_limits(Json(json!({ "status": "duplicate" })), decision));
            }
            Err(e) => warn!(source = source_type, "Idempotency store unavailable: {e}"),
        }
    }

    match state.processor.process_payload(source_type, payload).await {
        Ok(outcome) => Ok(with_limits(
            Json(Processed {
                status: "processed",
                outcome,
            }),
            decision,
        )),
        Err(err) => {
            // A redelivery must not be swallowed as a duplicate.
            if let (true, Some(key)) = (err.retryable(), &claim) {
                if let Err(e) = state.shared.release_claim(key).await {
                    warn!(source = source_type, "Failed to release delivery claim: {e}");
                }
            }
            Ok(with_limits(err, decision))
        }
    }
}

async fn reject(state: &AppState, source_type: &str, err: AppError) -> AppError {
    state.metrics.incr(Counter::WebhooksRejected).await;
    warn!(source = source_type, "Webhook rejected: {err}");
    err
}

fn with_limits(response: impl IntoResponse, decision: RateLimitDecision) -> Response {
    let mut response = response.into_response();
    decision.apply_headers(response.headers_mut());
    response
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn limit_key(source_type: &str, headers: &HeaderMap) -> String {
    format!("{source_type}:{}", client_key(headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobStage, JobStatus};
    use crate::models::source_config::SourceConfigDraft;
    use crate::reliability::signature::{SignatureVerifier, DEFAULT_TOLERANCE};
    use crate::routes::{build_router, test_support};
    use crate::store::MemoryPipelineStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn signed_slack(body: &str) -> Request<Body> {
        let verifier = SignatureVerifier::new(test_support::SIGNING_SECRET, DEFAULT_TOLERANCE);
        let ts = chrono::Utc::now().timestamp();
        let sig = verifier.sign(format!("v0:{ts}:{body}").as_bytes());
        Request::post("/webhooks/slack")
            .header("content-type", "application/json")
            .header(SLACK_TIMESTAMP_HEADER, ts.to_string())
            .header(SLACK_SIGNATURE_HEADER, format!("v0={sig}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn event(event_id: &str, extra: Value) -> String {
        let mut event = json!({
            "type": "message",
            "user": "U061F7AUR",
            "text": "Can we update the dashboard by Friday?",
            "ts": "1700000000.000200",
            "channel": "C024BE91L",
        });
        if let (Some(e), Some(x)) = (event.as_object_mut(), extra.as_object()) {
            e.extend(x.clone());
        }
        json!({
            "type": "event_callback",
            "team_id": "T0001",
            "event_id": event_id,
            "event": event,
        })
        .to_string()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn store_with_config() -> Arc<MemoryPipelineStore> {
        let store = Arc::new(MemoryPipelineStore::new());
        let mut config = SourceConfigDraft {
            team_id: Some("T0001".into()),
            api_token: Some("xoxb-test".into()),
            ..Default::default()
        }
        .into_config("slack");
        config.id = Uuid::new_v4();
        store.add_config(config);
        store
    }

    #[tokio::test]
    async fn test_url_verification_is_echoed() {
        let app = build_router(test_support::state(Arc::new(MemoryPipelineStore::new())));
        let body = r#"{"type":"url_verification","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"}"#;
        let response = app.oneshot(signed_slack(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"challenge": "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"})
        );
    }

    #[tokio::test]
    async fn test_bad_signature_is_401_before_pipeline() {
        let store = Arc::new(MemoryPipelineStore::new());
        let state = test_support::state(store.clone());
        let app = build_router(state.clone());
        let request = Request::post("/webhooks/slack")
            .header(SLACK_TIMESTAMP_HEADER, chrono::Utc::now().timestamp().to_string())
            .header(SLACK_SIGNATURE_HEADER, "v0=00ff")
            .body(Body::from(event("Ev1", json!({}))))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.jobs().is_empty());
        assert_eq!(state.metrics.snapshot().await.unwrap()["webhooks_rejected"], 1);
    }

    #[tokio::test]
    async fn test_bot_message_is_422_with_job_id() {
        let store = Arc::new(MemoryPipelineStore::new());
        let app = build_router(test_support::state(store.clone()));
        let body = event("Ev2", json!({"subtype": "bot_message"}));
        let response = app.oneshot(signed_slack(&body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let value = json_body(response).await;
        assert_eq!(value["retryable"], false);
        let jobs = store.jobs();
        assert_eq!(value["job_id"], json!(jobs[0].id));
        assert_eq!(jobs[0].stage, JobStage::Ingestion);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_503_and_redelivery_is_processed() {
        // The test wiring points the adapter at a closed port, so the
        // thread fetch fails with a connection error.
        let store = store_with_config();
        let app = build_router(test_support::state(store.clone()));
        let body = event("Ev3", json!({}));

        let first = app.clone().oneshot(signed_slack(&body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(first).await["retryable"], true);

        let second = app.oneshot(signed_slack(&body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let jobs = store.jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.stage == JobStage::ThreadBuilding));
    }

    #[tokio::test]
    async fn test_redelivered_event_is_acknowledged_once() {
        let store = Arc::new(MemoryPipelineStore::new());
        let app = build_router(test_support::state(store.clone()));
        let body = event("Ev4", json!({"subtype": "bot_message"}));

        let first = app.clone().oneshot(signed_slack(&body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let second = app.oneshot(signed_slack(&body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(json_body(second).await["status"], "duplicate");
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_mention_and_message_events_share_one_claim() {
        let store = Arc::new(MemoryPipelineStore::new());
        let app = build_router(test_support::state(store.clone()));
        let message = event("Ev5", json!({"subtype": "bot_message"}));
        let mention = event("Ev6", json!({"type": "app_mention", "subtype": "bot_message"}));

        let first = app.clone().oneshot(signed_slack(&message)).await.unwrap();
        assert_eq!(first.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let second = app.oneshot(signed_slack(&mention)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(json_body(second).await["status"], "duplicate");
        assert_eq!(store.jobs().len(), 1);
    }

    #[test]
    fn test_slack_claim_falls_back_to_event_id() {
        let keyed = json!({"event_id": "Ev7", "event": {"channel": "C1", "ts": "1.000001"}});
        assert_eq!(slack_claim(&keyed).as_deref(), Some("slack:msg:C1:1.000001"));
        let bare = json!({"event_id": "Ev7", "event": {"type": "reaction_added"}});
        assert_eq!(slack_claim(&bare).as_deref(), Some("slack:event:Ev7"));
        assert_eq!(slack_claim(&json!({})), None);
    }

    #[tokio::test]
    async fn test_figma_requires_signature_block() {
        let state = test_support::state(Arc::new(MemoryPipelineStore::new()));
        let app = build_router(state);
        let body = json!({
            "recipient": "comments+T0001@inbound.example.com",
            "from": "comments-abc123@email.figma.com",
            "body-plain": "@threadwise please align the cards",
        });
        let request = Request::post("/webhooks/figma")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_figma_signed_mail_without_file_key_is_422() {
        let store = Arc::new(MemoryPipelineStore::new());
        let app = build_router(test_support::state(store.clone()));
        let verifier = SignatureVerifier::new(test_support::SIGNING_SECRET, DEFAULT_TOLERANCE);
        let ts = chrono::Utc::now().timestamp().to_string();
        let token = "a8ce0edb2dd8301dee6c2405235584e45aa91d1e9f979f3de0";
        let body = json!({
            "recipient": "comments+T0001@inbound.example.com",
            "from": "Ana <notifications@example.com>",
            "body-plain": "Nothing useful here at all.",
            "signature": {
                "timestamp": ts,
                "token": token,
                "signature": verifier.sign(format!("{ts}{token}").as_bytes()),
            },
        });
        let request = Request::post("/webhooks/figma")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(store.jobs()[0].source_type, "figma");
    }
}
