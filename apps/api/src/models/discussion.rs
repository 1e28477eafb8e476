use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::UnknownVariant;

/// A normalized inbound discussion, produced by a source adapter.
/// Immutable once created; consumed by the processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedDiscussion {
    pub source_type: String,
    /// Composite `<container>:<item>` id, see `adapters::ThreadRef`.
    pub source_thread_id: String,
    pub source_url: String,
    pub team_id: String,
    pub author_handle: String,
    pub title: String,
    pub content: String,
    pub participants: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub author_handle: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A root message and its replies, oldest reply first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscussionThread {
    pub id: String,
    pub root_message: Message,
    pub replies: Vec<Message>,
    pub participants: BTreeSet<String>,
    pub metadata: Value,
}

impl DiscussionThread {
    /// Builds a thread, ordering replies by timestamp and collecting participants.
    pub fn new(id: String, root_message: Message, mut replies: Vec<Message>, metadata: Value) -> Self {
        // Stable sort keeps platform order for identical timestamps.
        replies.sort_by_key(|m| m.timestamp);
        let participants = std::iter::once(&root_message)
            .chain(replies.iter())
            .map(|m| m.author_handle.clone())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            id,
            root_message,
            replies,
            participants,
            metadata,
        }
    }

    /// A one-message thread made from the inbound discussion itself.
    /// Used when the origin thread cannot be located.
    pub fn from_discussion(discussion: &ParsedDiscussion) -> Self {
        let root = Message {
            id: discussion.source_thread_id.clone(),
            author_handle: discussion.author_handle.clone(),
            content: discussion.content.clone(),
            timestamp: discussion.timestamp,
        };
        let mut thread = Self::new(
            discussion.source_thread_id.clone(),
            root,
            Vec::new(),
            serde_json::json!({ "synthetic": true }),
        );
        thread
            .participants
            .extend(discussion.participants.iter().cloned());
        thread
    }

    pub fn message_count(&self) -> usize {
        1 + self.replies.len()
    }

    /// Plain transcript, one `author: text` line per message in causal order.
    pub fn transcript(&self) -> String {
        std::iter::once(&self.root_message)
            .chain(self.replies.iter())
            .map(|m| format!("[{}] {}: {}", m.timestamp.to_rfc3339(), m.author_handle, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DiscussionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscussionStatus::Pending => "pending",
            DiscussionStatus::Processing => "processing",
            DiscussionStatus::Completed => "completed",
            DiscussionStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for DiscussionStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(DiscussionStatus::Pending),
            "processing" => Ok(DiscussionStatus::Processing),
            "completed" => Ok(DiscussionStatus::Completed),
            "failed" => Ok(DiscussionStatus::Failed),
            _ => Err(UnknownVariant::new("discussion status", value)),
        }
    }
}

/// Persisted discussion: the parsed payload plus processing results.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DiscussionRow {
    pub id: Uuid,
    pub source_type: String,
    pub source_thread_id: String,
    pub source_url: String,
    pub team_id: String,
    pub author_handle: String,
    pub title: String,
    pub content: String,
    pub participants: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
    #[sqlx(try_from = "String")]
    pub status: DiscussionStatus,
    pub thread_data: Option<Value>,
    pub ai_summary: Option<Value>,
    pub ai_action_items: Option<Value>,
    pub created_task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DiscussionRow {
    pub fn from_parsed(parsed: &ParsedDiscussion) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_type: parsed.source_type.clone(),
            source_thread_id: parsed.source_thread_id.clone(),
            source_url: parsed.source_url.clone(),
            team_id: parsed.team_id.clone(),
            author_handle: parsed.author_handle.clone(),
            title: parsed.title.clone(),
            content: parsed.content.clone(),
            participants: parsed.participants.clone(),
            timestamp: parsed.timestamp,
            metadata: parsed.metadata.clone(),
            status: DiscussionStatus::Processing,
            thread_data: None,
            ai_summary: None,
            ai_action_items: None,
            created_task_ids: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Rebuilds the inbound payload so a failed discussion can be re-run.
    pub fn to_parsed(&self) -> ParsedDiscussion {
        ParsedDiscussion {
            source_type: self.source_type.clone(),
            source_thread_id: self.source_thread_id.clone(),
            source_url: self.source_url.clone(),
            team_id: self.team_id.clone(),
            author_handle: self.author_handle.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            participants: self.participants.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        }
    }

    /// Previously fetched thread, if it was stored and still deserializes.
    pub fn cached_thread(&self) -> Option<DiscussionThread> {
        self.thread_data
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}
