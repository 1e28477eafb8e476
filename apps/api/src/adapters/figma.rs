//! Comment platform adapter (Figma).
//!
//! Comments arrive as notification e-mails through the inbound-mail webhook.
//! The e-mail only carries a file key and rendered text, so the authoritative
//! comment is found afterwards by fuzzy-matching that text against the file's
//! comments through the REST API.
//!
//! Thread ids are `<file_key>:<comment_id>`. Until the comment is resolved
//! the item is `mail-<timestamp>`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    status_error, transport_error, SourceAdapter, StatusMarker, ThreadRef, ValidationReport,
};
use crate::errors::AppError;
use crate::extractor::{ContentExtractor, EmailPayload};
use crate::models::discussion::{DiscussionThread, Message, ParsedDiscussion};
use crate::models::source_config::{SourceConfig, SourceConfigDraft};

pub const SOURCE_TYPE: &str = "figma";
const API_BASE: &str = "https://api.figma.com";
const UNRESOLVED_PREFIX: &str = "mail-";

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user: Option<CommentUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentUser {
    pub handle: String,
}

impl Comment {
    /// Id of the thread this comment belongs to.
    pub fn root_id(&self) -> &str {
        self.parent_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.id)
    }

    fn into_message(self) -> Message {
        Message {
            id: self.id,
            author_handle: self.user.map(|u| u.handle).unwrap_or_default(),
            content: self.message,
            timestamp: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<Comment>,
}

pub struct FigmaAdapter {
    client: reqwest::Client,
    extractor: Arc<ContentExtractor>,
    api_base: String,
}

impl FigmaAdapter {
    pub fn new(client: reqwest::Client, extractor: Arc<ContentExtractor>) -> Self {
        Self {
            client,
            extractor,
            api_base: API_BASE.to_string(),
        }
    }

    /// Points the adapter at another API host, e.g. a proxy or a mock server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        config: &SourceConfig,
    ) -> Result<reqwest::Response, AppError> {
        let response = request
            .header("X-Figma-Token", &config.api_token)
            .send()
            .await
            .map_err(|e| transport_error(SOURCE_TYPE, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(SOURCE_TYPE, status, &body))
    }

    async fn list_comments(
        &self,
        file_key: &str,
        config: &SourceConfig,
    ) -> Result<Vec<Comment>, AppError> {
        let url = format!("{}/v1/files/{}/comments", self.api_base, file_key);
        let response = self.send(self.client.get(url), config).await?;
        let body: CommentsResponse = response.json().await.map_err(|e| {
            AppError::adapter(format!("figma comments: unreadable response: {e}"), true)
        })?;
        Ok(body.comments)
    }
}

/// `Team <figma+T123@inbound.example>` → `T123`; without a `+` tag the whole
/// local part is the team id.
pub fn team_from_recipient(recipient: &str) -> Option<String> {
    let address = bare_address(recipient);
    let local = address.split('@').next()?.trim();
    let team = local.split_once('+').map(|(_, tag)| tag).unwrap_or(local);
    (!team.is_empty()).then(|| team.to_string())
}

/// Display name of the comment author, falling back to the address.
pub fn author_from_sender(from: &str) -> String {
    let name = from
        .split('<')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"')
        .trim();
    let name = name
        .strip_suffix("(via Figma)")
        .or_else(|| name.strip_suffix("via Figma"))
        .unwrap_or(name)
        .trim();
    if name.is_empty() {
        bare_address(from).to_string()
    } else {
        name.to_string()
    }
}

fn bare_address(value: &str) -> &str {
    match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim(),
        _ => value.trim(),
    }
}

fn is_unresolved(thread: &ThreadRef) -> bool {
    thread.item.starts_with(UNRESOLVED_PREFIX)
}

fn emoji(marker: StatusMarker) -> &'static str {
    match marker {
        StatusMarker::ProcessingStarted => ":eyes:",
        StatusMarker::Queued => ":hourglass:",
        StatusMarker::Analyzing => ":thinking_face:",
        StatusMarker::Success => ":white_check_mark:",
        StatusMarker::Error => ":x:",
        StatusMarker::Retrying => ":repeat:",
    }
}

/// A reaction the comment already carries comes back as a 400/409.
fn already_reacted(err: &AppError) -> bool {
    match err {
        AppError::Adapter { message, .. } => {
            (message.contains("400") || message.contains("409"))
                && message.to_lowercase().contains("already")
        }
        _ => false,
    }
}

#[async_trait]
impl SourceAdapter for FigmaAdapter {
    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    async fn parse_incoming(&self, payload: &Value) -> Result<ParsedDiscussion, AppError> {
        let email: EmailPayload = serde_json::from_value(payload.clone())
            .map_err(|e| AppError::Validation(format!("malformed e-mail payload: {e}")))?;
        if email.from.trim().is_empty() {
            return Err(AppError::Validation("e-mail has no sender".into()));
        }
        let team_id = team_from_recipient(&email.recipient)
            .ok_or_else(|| AppError::Validation("e-mail has no usable recipient".into()))?;

        let extracted = self.extractor.extract(&email).await;
        let file_key = extracted
            .file_key
            .ok_or_else(|| AppError::Validation("no file key found in e-mail".into()))?;
        let text = extracted
            .text
            .ok_or_else(|| AppError::Validation("no comment text found in e-mail".into()))?;

        let timestamp = email
            .timestamp
            .as_deref()
            .and_then(|t| t.trim().parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        let thread = ThreadRef::new(
            file_key.file_key.clone(),
            format!("{UNRESOLVED_PREFIX}{}", timestamp.timestamp()),
        );
        let author = author_from_sender(&email.from);
        let title = if email.subject.trim().is_empty() {
            format!("Comment on {}", file_key.file_key)
        } else {
            email.subject.trim().to_string()
        };

        Ok(ParsedDiscussion {
            source_type: SOURCE_TYPE.to_string(),
            source_thread_id: thread.to_string(),
            source_url: self.deep_link(&thread),
            team_id,
            author_handle: author.clone(),
            title,
            content: text.text,
            participants: vec![author],
            timestamp,
            metadata: json!({
                "file_key": file_key.file_key,
                "file_key_strategy": file_key.strategy,
                "text_strategy": text.strategy,
                "recipient": email.recipient,
            }),
        })
    }

    async fn resolve_thread_id(
        &self,
        discussion: &ParsedDiscussion,
        config: &SourceConfig,
    ) -> Result<Option<String>, AppError> {
        let thread = ThreadRef::parse(&discussion.source_thread_id)?;
        if !is_unresolved(&thread) {
            return Ok(Some(thread.to_string()));
        }
        let comments = self.list_comments(&thread.container, config).await?;
        let Some(found) = self
            .extractor
            .correlate(&discussion.content, &comments, |c| c.message.as_str())
        else {
            info!(
                file_key = %thread.container,
                candidates = comments.len(),
                "No comment cleared the match threshold"
            );
            return Ok(None);
        };
        debug!(comment_id = %found.item.id, score = found.score, "Correlated e-mail to comment");
        Ok(Some(
            ThreadRef::new(thread.container, found.item.root_id()).to_string(),
        ))
    }

    async fn fetch_thread(
        &self,
        thread_id: &str,
        config: &SourceConfig,
    ) -> Result<DiscussionThread, AppError> {
        let thread = ThreadRef::parse(thread_id)?;
        if is_unresolved(&thread) {
            return Err(AppError::adapter(
                format!("figma thread {thread} was never matched to a comment"),
                false,
            ));
        }
        let comments = self.list_comments(&thread.container, config).await?;
        thread_from_comments(&thread, comments)
    }

    async fn post_reply(
        &self,
        thread_id: &str,
        message: &str,
        config: &SourceConfig,
    ) -> Result<(), AppError> {
        let thread = ThreadRef::parse(thread_id)?;
        if is_unresolved(&thread) {
            return Err(AppError::adapter("cannot reply to an unmatched comment", false));
        }
        let url = format!("{}/v1/files/{}/comments", self.api_base, thread.container);
        let request = self.client.post(url).json(&json!({
            "message": message,
            "comment_id": thread.item,
        }));
        self.send(request, config).await?;
        Ok(())
    }

    async fn update_status(
        &self,
        thread_id: &str,
        marker: StatusMarker,
        config: &SourceConfig,
    ) -> Result<(), AppError> {
        let thread = ThreadRef::parse(thread_id)?;
        if is_unresolved(&thread) {
            return Err(AppError::adapter("cannot react to an unmatched comment", false));
        }
        let url = format!(
            "{}/v1/files/{}/comments/{}/reactions",
            self.api_base, thread.container, thread.item
        );
        let request = self.client.post(url).json(&json!({ "emoji": emoji(marker) }));
        match self.send(request, config).await {
            Ok(_) => Ok(()),
            Err(e) if already_reacted(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn validate_config(&self, draft: &SourceConfigDraft) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        match draft.api_token.as_deref().map(str::trim) {
            None | Some("") => errors.push("api_token is required".to_string()),
            Some(t) if !t.starts_with("figd_") => {
                warnings.push("api_token does not look like a personal access token".into())
            }
            Some(_) => {}
        }
        if draft.team_id.as_deref().map_or(true, |t| t.trim().is_empty()) {
            errors.push("team_id is required".to_string());
        }
        if draft.notion_token.is_none() || draft.notion_database_id.is_none() {
            warnings.push("task database is not configured; task creation will fail".into());
        }
        ValidationReport::new(errors, warnings)
    }

    async fn test_connection(&self, config: &SourceConfig) -> Result<bool, AppError> {
        let url = format!("{}/v1/me", self.api_base);
        self.send(self.client.get(url), config).await?;
        Ok(true)
    }

    fn deep_link(&self, thread: &ThreadRef) -> String {
        let file = format!("https://www.figma.com/file/{}", thread.container);
        if is_unresolved(thread) {
            file
        } else {
            format!("{file}#{}", thread.item)
        }
    }
}

/// Root comment plus its replies.
fn thread_from_comments(
    thread: &ThreadRef,
    comments: Vec<Comment>,
) -> Result<DiscussionThread, AppError> {
    let mut root = None;
    let mut replies = Vec::new();
    for comment in comments {
        if comment.id == thread.item {
            root = Some(comment.into_message());
        } else if comment.parent_id.as_deref() == Some(thread.item.as_str()) {
            replies.push(comment.into_message());
        }
    }
    let root = root.ok_or_else(|| {
        AppError::adapter(format!("figma comment {} not found", thread.item), false)
    })?;
    Ok(DiscussionThread::new(
        thread.to_string(),
        root,
        replies,
        json!({ "file_key": thread.container }),
    ))
}
