//! External task creation (one Notion page per detected task).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::AppError;
use crate::extractor::html::truncate_chars;
use crate::models::discussion::ParsedDiscussion;
use crate::models::source_config::SourceConfig;
use crate::models::task::{DetectedTask, ExternalTaskRef};

const SERVICE: &str = "notion";
const NOTION_PAGES_URL: &str = "https://api.notion.com/v1/pages";
const NOTION_VERSION: &str = "2022-06-28";
/// Notion rejects rich-text objects longer than this.
const RICH_TEXT_LIMIT: usize = 2000;

/// Where a task came from, for the body of the external record.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub discussion: &'a ParsedDiscussion,
    pub summary: &'a str,
    /// `(index, total)` when the discussion produced several tasks.
    pub position: Option<(usize, usize)>,
}

#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create_task(
        &self,
        task: &DetectedTask,
        context: TaskContext<'_>,
        config: &SourceConfig,
    ) -> Result<ExternalTaskRef, AppError>;

    /// Withdraws a task created earlier in a run that did not finish.
    async fn archive_task(
        &self,
        task: &ExternalTaskRef,
        config: &SourceConfig,
    ) -> Result<(), AppError>;
}

pub struct NotionTaskService {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PageResponse {
    id: String,
    url: Option<String>,
}

impl NotionTaskService {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn token<'a>(config: &'a SourceConfig) -> Result<&'a str, AppError> {
        config.notion_token.as_deref().ok_or_else(|| {
            AppError::external(SERVICE, "no task database configured for this team", false)
        })
    }
}

/// 429 and 5xx are worth redelivering; any other rejection is final.
async fn rejection(response: reqwest::Response, action: &str) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let retryable = status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    AppError::external(SERVICE, format!("{action} returned {status}: {body}"), retryable)
}

fn rich_text(content: &str) -> Value {
    json!([{ "type": "text", "text": { "content": truncate_chars(content, RICH_TEXT_LIMIT) } }])
}

fn paragraph(content: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": rich_text(content) }
    })
}

/// Page body for one task in the configured database.
pub fn page_request(database_id: &str, task: &DetectedTask, context: &TaskContext<'_>) -> Value {
    let mut properties = json!({
        "Name": { "title": rich_text(&task.title) },
        "Priority": { "select": { "name": task.priority } },
        "Source": { "url": context.discussion.source_url },
        "Platform": { "select": { "name": context.discussion.source_type } },
    });
    if !task.tags.is_empty() {
        let tags: Vec<Value> = task.tags.iter().map(|t| json!({ "name": t })).collect();
        properties["Tags"] = json!({ "multi_select": tags });
    }
    if let Some(assignee) = &task.assignee {
        properties["Assignee"] = json!({ "rich_text": rich_text(assignee) });
    }

    let mut children = vec![paragraph(&task.description)];
    if !context.summary.is_empty() {
        children.push(paragraph(&format!("Discussion summary: {}", context.summary)));
    }
    if let Some((index, total)) = context.position {
        children.push(paragraph(&format!("Task {} of {} from this discussion.", index + 1, total)));
    }

    json!({
        "parent": { "database_id": database_id },
        "properties": properties,
        "children": children,
    })
}

#[async_trait]
impl TaskService for NotionTaskService {
    async fn create_task(
        &self,
        task: &DetectedTask,
        context: TaskContext<'_>,
        config: &SourceConfig,
    ) -> Result<ExternalTaskRef, AppError> {
        let token = Self::token(config)?;
        let Some(database_id) = config.notion_database_id.as_deref() else {
            return Err(AppError::external(
                SERVICE,
                "no task database configured for this team",
                false,
            ));
        };

        let response = self
            .client
            .post(NOTION_PAGES_URL)
            .bearer_auth(token)
            .header("Notion-Version", NOTION_VERSION)
            .json(&page_request(database_id, task, &context))
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, e.to_string(), true))?;

        if !response.status().is_success() {
            return Err(rejection(response, "page creation").await);
        }

        let page: PageResponse = response
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("unreadable response: {e}"), true))?;
        debug!(page_id = %page.id, "Created task page");
        Ok(ExternalTaskRef {
            id: page.id,
            url: page.url,
        })
    }

    async fn archive_task(
        &self,
        task: &ExternalTaskRef,
        config: &SourceConfig,
    ) -> Result<(), AppError> {
        let response = self
            .client
            .patch(format!("{NOTION_PAGES_URL}/{}", task.id))
            .bearer_auth(Self::token(config)?)
            .header("Notion-Version", NOTION_VERSION)
            .json(&json!({ "archived": true }))
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, e.to_string(), true))?;
        if !response.status().is_success() {
            return Err(rejection(response, "page archive").await);
        }
        debug!(page_id = %task.id, "Archived task page");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn discussion() -> ParsedDiscussion {
        ParsedDiscussion {
            source_type: "figma".into(),
            source_thread_id: "K:100".into(),
            source_url: "https://www.figma.com/file/K#100".into(),
            team_id: "T1".into(),
            author_handle: "Ana".into(),
            title: "Pricing".into(),
            content: "align the cards".into(),
            participants: vec![],
            timestamp: Utc::now(),
            metadata: json!({}),
        }
    }

    fn task() -> DetectedTask {
        DetectedTask {
            title: "Align pricing cards".into(),
            description: "x".repeat(3000),
            priority: "high".into(),
            assignee: Some("Ben".into()),
            tags: vec!["design".into()],
        }
    }

    #[test]
    fn test_page_request_shape() {
        let d = discussion();
        let body = page_request(
            "db1",
            &task(),
            &TaskContext {
                discussion: &d,
                summary: "Cards are misaligned",
                position: Some((1, 3)),
            },
        );
        assert_eq!(body["parent"]["database_id"], "db1");
        assert_eq!(
            body["properties"]["Name"]["title"][0]["text"]["content"],
            "Align pricing cards"
        );
        assert_eq!(body["properties"]["Source"]["url"], d.source_url);
        assert_eq!(body["properties"]["Tags"]["multi_select"][0]["name"], "design");
        let children = body["children"].as_array().unwrap();
        assert_eq!(children.len(), 3);
        let first = children[0]["paragraph"]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap();
        assert_eq!(first.chars().count(), RICH_TEXT_LIMIT);
        assert_eq!(
            children[2]["paragraph"]["rich_text"][0]["text"]["content"],
            "Task 2 of 3 from this discussion."
        );
    }

    #[tokio::test]
    async fn test_missing_database_is_not_retryable() {
        let d = discussion();
        let config = crate::models::source_config::SourceConfigDraft::default().into_config("figma");
        let err = NotionTaskService::new(reqwest::Client::new())
            .create_task(
                &task(),
                TaskContext {
                    discussion: &d,
                    summary: "",
                    position: None,
                },
                &config,
            )
            .await
            .unwrap_err();
        assert!(!err.retryable());
    }
}
