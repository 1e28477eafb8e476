//! Chat platform adapter (Slack Events API + Web API).
//!
//! Thread ids are `<channel>:<thread_ts>`, where `thread_ts` is the root
//! message timestamp (a top-level message is its own root).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::{
    status_error, transport_error, SourceAdapter, StatusMarker, ThreadRef, ValidationReport,
};
use crate::errors::AppError;
use crate::extractor::html::truncate_chars;
use crate::models::discussion::{DiscussionThread, Message, ParsedDiscussion};
use crate::models::source_config::{SourceConfig, SourceConfigDraft};

pub const SOURCE_TYPE: &str = "slack";
const API_BASE: &str = "https://slack.com/api";
const TITLE_CHARS: usize = 80;
const REPLIES_PAGE_SIZE: &str = "200";
/// Guards against a cursor that never runs out.
const MAX_REPLY_PAGES: usize = 50;

/// System-generated subtypes that never carry a human request.
pub const REJECTED_SUBTYPES: &[&str] = &[
    "bot_message",
    "message_changed",
    "message_deleted",
    "channel_join",
    "channel_leave",
    "channel_topic",
    "channel_purpose",
    "channel_name",
];

const HANDLED_EVENTS: &[&str] = &["message", "app_mention"];

/// Web API `error` codes that mean the token is unusable.
const AUTH_ERRORS: &[&str] = &[
    "not_authed",
    "invalid_auth",
    "token_revoked",
    "token_expired",
    "account_inactive",
    "missing_scope",
];

const TRANSIENT_ERRORS: &[&str] = &[
    "ratelimited",
    "internal_error",
    "fatal_error",
    "service_unavailable",
    "request_timeout",
];

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(alias = "teamId")]
    team_id: Option<String>,
    event_id: Option<String>,
    event: Option<ChatEvent>,
}

#[derive(Debug, Deserialize)]
struct ChatEvent {
    #[serde(rename = "type")]
    kind: String,
    user: Option<String>,
    #[serde(default)]
    text: String,
    ts: Option<String>,
    channel: Option<String>,
    thread_ts: Option<String>,
    subtype: Option<String>,
    bot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebApiResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

impl WebApiResponse {
    /// Cursor for the next page; Slack sends an empty string on the last one.
    fn next_cursor(&self) -> Option<String> {
        self.response_metadata
            .as_ref()
            .and_then(|m| m.next_cursor.clone())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    ts: String,
    user: Option<String>,
    username: Option<String>,
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
}

pub struct SlackAdapter {
    client: reqwest::Client,
    api_base: String,
}

impl SlackAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: API_BASE.to_string(),
        }
    }

    /// Points the adapter at another API host, e.g. a proxy or a mock server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn call(
        &self,
        method: &str,
        config: &SourceConfig,
        request: reqwest::RequestBuilder,
    ) -> Result<WebApiResponse, AppError> {
        let response = request
            .bearer_auth(&config.api_token)
            .send()
            .await
            .map_err(|e| transport_error(SOURCE_TYPE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SOURCE_TYPE, status, &body));
        }
        let body: WebApiResponse = response
            .json()
            .await
            .map_err(|e| AppError::adapter(format!("slack {method}: unreadable response: {e}"), true))?;
        debug!(method, ok = body.ok, "Slack Web API call");
        Ok(body)
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }
}

/// `1700000000.000200` → UTC instant.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{frac:0<6}").get(..6)?.parse().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

/// Turns an `ok: false` Web API body into an adapter error.
fn api_error(method: &str, code: Option<&str>) -> AppError {
    let code = code.unwrap_or("unknown_error");
    let retryable = TRANSIENT_ERRORS.contains(&code);
    let reason = if AUTH_ERRORS.contains(&code) {
        "invalid credentials"
    } else {
        code
    };
    AppError::adapter(format!("slack {method} failed: {reason}"), retryable)
}

fn message_from_api(m: ApiMessage) -> Option<Message> {
    Some(Message {
        timestamp: parse_ts(&m.ts)?,
        author_handle: m.user.or(m.username).or(m.bot_id).unwrap_or_default(),
        content: m.text,
        id: m.ts,
    })
}

/// Root plus replies from every `conversations.replies` page. Each page
/// repeats the root, so messages are kept once per `ts`.
fn thread_from_messages(
    thread: &ThreadRef,
    messages: Vec<ApiMessage>,
) -> Result<DiscussionThread, AppError> {
    let mut seen = HashSet::new();
    let mut root = None;
    let mut replies = Vec::new();
    for message in messages.into_iter().filter_map(message_from_api) {
        if !seen.insert(message.id.clone()) {
            continue;
        }
        if message.id == thread.item {
            root = Some(message);
        } else {
            replies.push(message);
        }
    }
    let root = root.ok_or_else(|| {
        AppError::adapter(format!("slack thread {thread} has no root message"), false)
    })?;
    Ok(DiscussionThread::new(
        thread.to_string(),
        root,
        replies,
        json!({ "channel": thread.container }),
    ))
}

#[async_trait]
impl SourceAdapter for SlackAdapter {
    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    async fn parse_incoming(&self, payload: &Value) -> Result<ParsedDiscussion, AppError> {
        let envelope: EventEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| AppError::Validation(format!("malformed event envelope: {e}")))?;

        if envelope.kind != "event_callback" {
            return Err(AppError::Validation(format!(
                "unsupported envelope type '{}'",
                envelope.kind
            )));
        }
        let team_id = envelope
            .team_id
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Validation("missing team id".into()))?;
        let event = envelope
            .event
            .ok_or_else(|| AppError::Validation("missing event".into()))?;

        if !HANDLED_EVENTS.contains(&event.kind.as_str()) {
            return Err(AppError::Validation(format!(
                "unsupported event type '{}'",
                event.kind
            )));
        }
        if let Some(subtype) = event.subtype.as_deref() {
            if REJECTED_SUBTYPES.contains(&subtype) {
                return Err(AppError::Validation(format!(
                    "system message subtype '{subtype}' is not processed"
                )));
            }
        }
        if event.bot_id.is_some() {
            return Err(AppError::Validation("bot messages are not processed".into()));
        }

        let user = event
            .user
            .ok_or_else(|| AppError::Validation("event has no user".into()))?;
        let channel = event
            .channel
            .ok_or_else(|| AppError::Validation("event has no channel".into()))?;
        let ts = event
            .ts
            .ok_or_else(|| AppError::Validation("event has no ts".into()))?;
        let timestamp = parse_ts(&ts)
            .ok_or_else(|| AppError::Validation(format!("invalid message ts '{ts}'")))?;
        let text = event.text.trim().to_string();
        if text.is_empty() {
            return Err(AppError::Validation("message text is empty".into()));
        }

        let thread_ts = event.thread_ts.clone().unwrap_or_else(|| ts.clone());
        let thread = ThreadRef::new(channel.clone(), thread_ts);
        let title = text.lines().next().unwrap_or_default();

        Ok(ParsedDiscussion {
            source_type: SOURCE_TYPE.to_string(),
            source_thread_id: thread.to_string(),
            source_url: self.deep_link(&thread),
            team_id,
            author_handle: user.clone(),
            title: truncate_chars(title, TITLE_CHARS),
            content: text,
            participants: vec![user],
            timestamp,
            metadata: json!({
                "channel": channel,
                "ts": ts,
                "thread_ts": event.thread_ts,
                "event_type": event.kind,
                "event_id": envelope.event_id,
            }),
        })
    }

    async fn fetch_thread(
        &self,
        thread_id: &str,
        config: &SourceConfig,
    ) -> Result<DiscussionThread, AppError> {
        let thread = ThreadRef::parse(thread_id)?;
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        for page in 1..=MAX_REPLY_PAGES {
            let mut query = vec![
                ("channel", thread.container.as_str()),
                ("ts", thread.item.as_str()),
                ("limit", REPLIES_PAGE_SIZE),
            ];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }
            let request = self
                .client
                .get(self.url("conversations.replies"))
                .query(&query);
            let body = self.call("conversations.replies", config, request).await?;
            if !body.ok {
                return Err(api_error("conversations.replies", body.error.as_deref()));
            }
            cursor = body.next_cursor();
            debug!(page, count = body.messages.len(), "Fetched thread page");
            messages.extend(body.messages);
            if cursor.is_none() {
                break;
            }
        }
        if cursor.is_some() {
            warn!(thread = %thread, pages = MAX_REPLY_PAGES, "Thread truncated at page limit");
        }
        thread_from_messages(&thread, messages)
    }

    async fn post_reply(
        &self,
        thread_id: &str,
        message: &str,
        config: &SourceConfig,
    ) -> Result<(), AppError> {
        let thread = ThreadRef::parse(thread_id)?;
        let request = self.client.post(self.url("chat.postMessage")).json(&json!({
            "channel": thread.container,
            "thread_ts": thread.item,
            "text": message,
        }));
        let body = self.call("chat.postMessage", config, request).await?;
        if !body.ok {
            return Err(api_error("chat.postMessage", body.error.as_deref()));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        thread_id: &str,
        marker: StatusMarker,
        config: &SourceConfig,
    ) -> Result<(), AppError> {
        let thread = ThreadRef::parse(thread_id)?;
        let request = self.client.post(self.url("reactions.add")).json(&json!({
            "channel": thread.container,
            "timestamp": thread.item,
            "name": reaction_name(marker),
        }));
        let body = self.call("reactions.add", config, request).await?;
        match (body.ok, body.error.as_deref()) {
            (true, _) | (false, Some("already_reacted")) => Ok(()),
            (false, code) => Err(api_error("reactions.add", code)),
        }
    }

    fn validate_config(&self, draft: &SourceConfigDraft) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match draft.api_token.as_deref().map(str::trim) {
            None | Some("") => errors.push("api_token is required".to_string()),
            Some(t) if t.starts_with("xoxb-") => {}
            Some(t) if t.starts_with("xoxp-") => {
                warnings.push("api_token is a user token; a bot token (xoxb-) is expected".into())
            }
            Some(_) => errors.push("api_token must be a bot token starting with xoxb-".into()),
        }
        match draft.team_id.as_deref().map(str::trim) {
            None | Some("") => errors.push("team_id is required".to_string()),
            Some(t) if !t.starts_with('T') => {
                warnings.push(format!("team_id '{t}' does not look like a workspace id"))
            }
            Some(_) => {}
        }
        if draft.notion_token.is_none() || draft.notion_database_id.is_none() {
            warnings.push("task database is not configured; task creation will fail".into());
        }
        ValidationReport::new(errors, warnings)
    }

    async fn test_connection(&self, config: &SourceConfig) -> Result<bool, AppError> {
        let request = self.client.post(self.url("auth.test"));
        let body = self.call("auth.test", config, request).await?;
        if body.ok {
            return Ok(true);
        }
        let code = body.error.as_deref();
        if code.is_some_and(|c| AUTH_ERRORS.contains(&c) || TRANSIENT_ERRORS.contains(&c)) {
            return Err(api_error("auth.test", code));
        }
        Ok(false)
    }

    fn deep_link(&self, thread: &ThreadRef) -> String {
        format!(
            "https://slack.com/archives/{}/p{}",
            thread.container,
            thread.item.replace('.', "")
        )
    }
}

pub fn reaction_name(marker: StatusMarker) -> &'static str {
    match marker {
        StatusMarker::ProcessingStarted => "eyes",
        StatusMarker::Queued => "hourglass_flowing_sand",
        StatusMarker::Analyzing => "brain",
        StatusMarker::Success => "white_check_mark",
        StatusMarker::Error => "x",
        StatusMarker::Retrying => "arrows_counterclockwise",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn adapter() -> SlackAdapter {
        SlackAdapter::new(reqwest::Client::new())
    }

    fn event(extra: Value) -> Value {
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
            "event_id": "Ev0PV52K21",
            "event": event,
        })
    }

    #[tokio::test]
    async fn test_parses_top_level_message() {
        let parsed = adapter().parse_incoming(&event(json!({}))).await.unwrap();
        assert_eq!(parsed.source_type, "slack");
        assert_eq!(parsed.team_id, "T0001");
        assert_eq!(parsed.source_thread_id, "C024BE91L:1700000000.000200");
        assert_eq!(
            parsed.source_url,
            "https://slack.com/archives/C024BE91L/p1700000000000200"
        );
        assert_eq!(parsed.content, "Can we update the dashboard by Friday?");
        assert_eq!(parsed.participants, vec!["U061F7AUR"]);
        assert_eq!(parsed.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(parsed.metadata["event_id"], "Ev0PV52K21");
    }

    #[tokio::test]
    async fn test_reply_uses_thread_root() {
        let parsed = adapter()
            .parse_incoming(&event(json!({"thread_ts": "1699999999.000100"})))
            .await
            .unwrap();
        assert_eq!(parsed.source_thread_id, "C024BE91L:1699999999.000100");
    }

    #[tokio::test]
    async fn test_system_subtypes_are_rejected() {
        for subtype in REJECTED_SUBTYPES {
            let err = adapter()
                .parse_incoming(&event(json!({ "subtype": subtype })))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{subtype}");
            assert!(!err.retryable());
        }
    }

    #[tokio::test]
    async fn test_bot_authored_and_empty_messages_are_rejected() {
        let a = adapter();
        assert!(a.parse_incoming(&event(json!({"bot_id": "B1"}))).await.is_err());
        assert!(a.parse_incoming(&event(json!({"text": "   "}))).await.is_err());
        assert!(a
            .parse_incoming(&json!({"type": "event_callback", "team_id": "T1"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_thread_broadcast_is_accepted() {
        let parsed = adapter()
            .parse_incoming(&event(json!({"subtype": "thread_broadcast"})))
            .await;
        assert!(parsed.is_ok());
    }

    #[test]
    fn test_parse_ts() {
        let t = parse_ts("1700000000.000200").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_micros(), 200);
        assert!(parse_ts("yesterday").is_none());
        assert_eq!(parse_ts("1700000000").unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_thread_from_replies_orders_by_time() {
        let thread = ThreadRef::new("C1", "100.000001");
        let messages: Vec<ApiMessage> = serde_json::from_value(json!([
            {"ts": "100.000001", "user": "U1", "text": "root"},
            {"ts": "300.000000", "user": "U3", "text": "late"},
            {"ts": "200.000000", "user": "U2", "text": "early"}
        ]))
        .unwrap();
        let built = thread_from_messages(&thread, messages).unwrap();
        assert_eq!(built.root_message.content, "root");
        let order: Vec<_> = built.replies.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["early", "late"]);
        assert_eq!(built.participants.len(), 3);
    }

    #[test]
    fn test_repeated_root_across_pages_is_kept_once() {
        let thread = ThreadRef::new("C1", "100.000001");
        let messages: Vec<ApiMessage> = serde_json::from_value(json!([
            {"ts": "100.000001", "user": "U1", "text": "root"},
            {"ts": "200.000000", "user": "U2", "text": "first page"},
            {"ts": "100.000001", "user": "U1", "text": "root"},
            {"ts": "300.000000", "user": "U3", "text": "second page"}
        ]))
        .unwrap();
        let built = thread_from_messages(&thread, messages).unwrap();
        assert_eq!(built.message_count(), 3);
        let order: Vec<_> = built.replies.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["first page", "second page"]);
    }

    /// Serves two pages of `conversations.replies`, chained by cursor.
    async fn paged_replies(
        axum::extract::Query(query): axum::extract::Query<HashMap<String, String>>,
    ) -> axum::Json<Value> {
        let root = json!({"ts": "100.000001", "user": "U1", "text": "root"});
        axum::Json(match query.get("cursor").map(String::as_str) {
            None => json!({
                "ok": true,
                "messages": [root, {"ts": "200.000000", "user": "U2", "text": "one"}],
                "has_more": true,
                "response_metadata": {"next_cursor": "bmV4dF90czoz"},
            }),
            Some("bmV4dF90czoz") => json!({
                "ok": true,
                "messages": [root, {"ts": "300.000000", "user": "U3", "text": "two"}],
                "has_more": false,
                "response_metadata": {"next_cursor": ""},
            }),
            Some(other) => json!({"ok": false, "error": format!("invalid_cursor {other}")}),
        })
    }

    #[tokio::test]
    async fn test_fetch_thread_follows_cursor() {
        let app = axum::Router::new().route(
            "/conversations.replies",
            axum::routing::get(paged_replies),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = SourceConfigDraft {
            team_id: Some("T0001".into()),
            api_token: Some("xoxb-test".into()),
            ..Default::default()
        }
        .into_config(SOURCE_TYPE);
        let thread = adapter()
            .with_api_base(format!("http://{addr}/"))
            .fetch_thread("C1:100.000001", &config)
            .await
            .unwrap();

        assert_eq!(thread.root_message.content, "root");
        let order: Vec<_> = thread.replies.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["one", "two"]);
    }

    #[test]
    fn test_missing_root_is_not_retryable() {
        let thread = ThreadRef::new("C1", "1.000000");
        let err = thread_from_messages(&thread, Vec::new()).unwrap_err();
        assert!(!err.retryable());
    }

    #[test]
    fn test_api_error_classification() {
        assert!(api_error("x", Some("ratelimited")).retryable());
        assert!(!api_error("x", Some("invalid_auth")).retryable());
        assert!(api_error("x", Some("invalid_auth"))
            .to_string()
            .contains("invalid credentials"));
    }

    #[test]
    fn test_validate_config() {
        let a = adapter();
        let report = a.validate_config(&SourceConfigDraft {
            team_id: Some("T0001".into()),
            api_token: Some("xoxb-123".into()),
            notion_token: Some("secret_x".into()),
            notion_database_id: Some("db".into()),
            ai_enabled: None,
        });
        assert!(report.valid);
        assert!(report.warnings.is_empty());

        let report = a.validate_config(&SourceConfigDraft::default());
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_every_marker_has_a_reaction() {
        use std::collections::HashSet;
        let markers = [
            StatusMarker::ProcessingStarted,
            StatusMarker::Queued,
            StatusMarker::Analyzing,
            StatusMarker::Success,
            StatusMarker::Error,
            StatusMarker::Retrying,
        ];
        let names: HashSet<_> = markers.iter().map(|m| reaction_name(*m)).collect();
        assert_eq!(names.len(), markers.len());
    }
}
