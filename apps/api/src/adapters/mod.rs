//! Source adapters: one type per platform family, all behind [`SourceAdapter`].
//!
//! The processor never branches on platform; it looks an adapter up in the
//! [`AdapterRegistry`] by `source_type` and talks to the trait.

pub mod figma;
pub mod slack;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::AppError;
use crate::models::discussion::{DiscussionThread, ParsedDiscussion};
use crate::models::source_config::{SourceConfig, SourceConfigDraft};

pub use self::figma::FigmaAdapter;
pub use self::slack::SlackAdapter;

/// Visual progress codes shown on the origin thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMarker {
    ProcessingStarted,
    /// Mapped for every platform, but the inline pipeline has no queue to report.
    #[allow(dead_code)]
    Queued,
    Analyzing,
    Success,
    Error,
    Retrying,
}

impl StatusMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusMarker::ProcessingStarted => "processing_started",
            StatusMarker::Queued => "queued",
            StatusMarker::Analyzing => "analyzing",
            StatusMarker::Success => "success",
            StatusMarker::Error => "error",
            StatusMarker::Retrying => "retrying",
        }
    }
}

/// Composite thread id `<container>:<item>`.
///
/// The container is a channel or file key, the item a message timestamp or
/// comment id. The same string is the fetch key and the deep-link source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRef {
    pub container: String,
    pub item: String,
}

impl ThreadRef {
    pub fn new(container: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            item: item.into(),
        }
    }

    pub fn parse(id: &str) -> Result<Self, AppError> {
        match id.split_once(':') {
            Some((container, item)) if !container.is_empty() && !item.is_empty() => {
                Ok(Self::new(container, item))
            }
            _ => Err(AppError::Validation(format!(
                "thread id '{id}' is not of the form <container>:<item>"
            ))),
        }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.item)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry key and `source_type` of every discussion this adapter parses.
    fn source_type(&self) -> &'static str;

    /// Normalizes a raw webhook payload. Unsupported or system-generated
    /// payloads fail with `AppError::Validation`.
    async fn parse_incoming(&self, payload: &Value) -> Result<ParsedDiscussion, AppError>;

    /// Maps a parsed discussion onto the platform's own thread id.
    /// `None` means the origin thread could not be located.
    async fn resolve_thread_id(
        &self,
        discussion: &ParsedDiscussion,
        _config: &SourceConfig,
    ) -> Result<Option<String>, AppError> {
        Ok(Some(discussion.source_thread_id.clone()))
    }

    /// All messages of a thread, replies in time order.
    async fn fetch_thread(
        &self,
        thread_id: &str,
        config: &SourceConfig,
    ) -> Result<DiscussionThread, AppError>;

    async fn post_reply(
        &self,
        thread_id: &str,
        message: &str,
        config: &SourceConfig,
    ) -> Result<(), AppError>;

    /// Shows `marker` on the thread. A marker that is already present is success.
    async fn update_status(
        &self,
        thread_id: &str,
        marker: StatusMarker,
        config: &SourceConfig,
    ) -> Result<(), AppError>;

    /// Offline checks only.
    fn validate_config(&self, draft: &SourceConfigDraft) -> ValidationReport;

    /// One authenticated round trip. Bad credentials surface as a
    /// non-retryable adapter error, network trouble as a retryable one.
    async fn test_connection(&self, config: &SourceConfig) -> Result<bool, AppError>;

    /// Browser URL of a thread.
    fn deep_link(&self, thread: &ThreadRef) -> String;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> &mut Self {
        self.adapters.insert(adapter.source_type(), adapter);
        self
    }

    pub fn get(&self, source_type: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_type).cloned()
    }

    /// Like [`get`](Self::get) but an unknown platform is a `NotFound`.
    pub fn require(&self, source_type: &str) -> Result<Arc<dyn SourceAdapter>, AppError> {
        self.get(source_type)
            .ok_or_else(|| AppError::NotFound(format!("unsupported source type '{source_type}'")))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// A request that never got a usable response.
pub(crate) fn transport_error(platform: &str, e: reqwest::Error) -> AppError {
    let retryable = e.is_timeout() || e.is_connect() || e.is_request();
    AppError::adapter(format!("{platform} request failed: {e}"), retryable)
}

/// A response whose status says the call failed.
pub(crate) fn status_error(platform: &str, status: reqwest::StatusCode, body: &str) -> AppError {
    let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    let detail = match status.as_u16() {
        401 | 403 => "invalid credentials",
        404 => "not found",
        _ => body,
    };
    AppError::adapter(format!("{platform} returned {status}: {detail}"), retryable)
}
