use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::adapters::ValidationReport;
use crate::errors::AppError;
use crate::models::source_config::SourceConfigDraft;
use crate::state::AppState;

/// Lifetime of an installation state token.
const INSTALL_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// GET /api/v1/sources
pub async fn handle_list_sources(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sources": state.adapters.names() }))
}

/// POST /api/v1/sources/:source_type/validate
pub async fn handle_validate(
    State(state): State<AppState>,
    Path(source_type): Path<String>,
    Json(draft): Json<SourceConfigDraft>,
) -> Result<Json<ValidationReport>, AppError> {
    let adapter = state.adapters.require(&source_type)?;
    Ok(Json(adapter.validate_config(&draft)))
}

#[derive(Serialize)]
pub struct ConnectionResponse {
    pub connected: bool,
    pub warnings: Vec<String>,
}

/// POST /api/v1/sources/:source_type/test
///
/// Runs the offline checks first; only a valid draft costs a network call.
pub async fn handle_test_connection(
    State(state): State<AppState>,
    Path(source_type): Path<String>,
    Json(draft): Json<SourceConfigDraft>,
) -> Result<Json<ConnectionResponse>, AppError> {
    let adapter = state.adapters.require(&source_type)?;
    let report = adapter.validate_config(&draft);
    if !report.valid {
        return Err(AppError::Validation(report.errors.join("; ")));
    }
    let connected = adapter
        .test_connection(&draft.into_config(&source_type))
        .await?;
    Ok(Json(ConnectionResponse {
        connected,
        warnings: report.warnings,
    }))
}

#[derive(Deserialize)]
pub struct InstallRequest {
    pub team_id: String,
}

#[derive(Serialize)]
pub struct InstallStateResponse {
    pub state: String,
    pub expires_in_secs: u64,
}

/// POST /api/v1/sources/:source_type/install
///
/// Issues the single-use `state` value an installation redirect must carry back.
pub async fn handle_issue_install_state(
    State(state): State<AppState>,
    Path(source_type): Path<String>,
    Json(req): Json<InstallRequest>,
) -> Result<Json<InstallStateResponse>, AppError> {
    state.adapters.require(&source_type)?;
    let team_id = req.team_id.trim();
    if team_id.is_empty() {
        return Err(AppError::Validation("team_id is required".into()));
    }

    let token = Uuid::new_v4().simple().to_string();
    state
        .shared
        .put_token(&token, &format!("{source_type}:{team_id}"), INSTALL_STATE_TTL)
        .await?;
    Ok(Json(InstallStateResponse {
        state: token,
        expires_in_secs: INSTALL_STATE_TTL.as_secs(),
    }))
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub state: String,
}

/// GET /api/v1/sources/:source_type/install/callback?state=
///
/// Consumes the state token. A replayed, expired or foreign token is a security error.
pub async fn handle_install_callback(
    State(state): State<AppState>,
    Path(source_type): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>, AppError> {
    let value = state
        .shared
        .take_token(&query.state)
        .await?
        .ok_or_else(|| AppError::Security("unknown or expired install state".into()))?;
    let team_id = value
        .strip_prefix(&format!("{source_type}:"))
        .ok_or_else(|| AppError::Security("install state was issued for another source".into()))?;

    info!(source = %source_type, team = %team_id, "Installation state verified");
    Ok(Json(json!({
        "source_type": source_type,
        "team_id": team_id,
        "status": "verified",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{build_router, test_support};
    use crate::store::MemoryPipelineStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> axum::Router {
        build_router(test_support::state(Arc::new(MemoryPipelineStore::new())))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validate_reports_errors_and_warnings() {
        let response = app()
            .oneshot(post_json(
                "/api/v1/sources/slack/validate",
                json!({"api_token": "xoxp-user", "team_id": "T0001"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["valid"], true);
        assert!(report["warnings"].as_array().unwrap().len() >= 2);

        let response = app()
            .oneshot(post_json("/api/v1/sources/slack/validate", json!({})))
            .await
            .unwrap();
        let report = json_body(response).await;
        assert_eq!(report["valid"], false);
    }

    #[tokio::test]
    async fn test_unknown_source_is_404() {
        let response = app()
            .oneshot(post_json("/api/v1/sources/jira/validate", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connection_on_invalid_draft_is_422() {
        let response = app()
            .oneshot(post_json("/api/v1/sources/slack/test", json!({"team_id": "T1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unreachable_platform_is_503() {
        let response = app()
            .oneshot(post_json(
                "/api/v1/sources/slack/test",
                json!({"team_id": "T0001", "api_token": "xoxb-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["retryable"], true);
    }

    #[tokio::test]
    async fn test_install_state_is_single_use() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/sources/slack/install",
                json!({"team_id": "T0001"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = json_body(response).await["state"]
            .as_str()
            .unwrap()
            .to_string();

        let callback = |source: &str| {
            Request::get(format!("/api/v1/sources/{source}/install/callback?state={token}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(callback("slack")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["team_id"], "T0001");

        let replay = app.oneshot(callback("slack")).await.unwrap();
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_install_state_is_bound_to_its_source() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/sources/figma/install",
                json!({"team_id": "acme"}),
            ))
            .await
            .unwrap();
        let token = json_body(response).await["state"]
            .as_str()
            .unwrap()
            .to_string();
        let response = app
            .oneshot(
                Request::get(format!("/api/v1/sources/slack/install/callback?state={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
