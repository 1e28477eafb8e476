//! Discussion analysis: summary plus detected follow-up tasks.

pub mod prompts;

use async_trait::async_trait;
use tracing::info;

use crate::errors::AppError;
use crate::extractor::html::truncate_chars;
use crate::llm_client::{LlmClient, LlmError};
use crate::models::discussion::{DiscussionThread, ParsedDiscussion};
use crate::models::task::{AiSummary, AnalysisResult, DetectedTask};

const SERVICE: &str = "analysis";
const PRIORITIES: &[&str] = &["low", "medium", "high", "urgent"];
const TITLE_CHARS: usize = 80;

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        discussion: &ParsedDiscussion,
        thread: &DiscussionThread,
    ) -> Result<AnalysisResult, AppError>;
}

pub struct LlmAnalyzer {
    llm: LlmClient,
}

impl LlmAnalyzer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        discussion: &ParsedDiscussion,
        thread: &DiscussionThread,
    ) -> Result<AnalysisResult, AppError> {
        let prompt = prompts::build_analysis_prompt(discussion, thread);
        let result: AnalysisResult = self
            .llm
            .call_json(&prompt, &prompts::system_prompt())
            .await
            .map_err(analysis_error)?;
        let result = sanitize(result);
        info!(
            tasks = result.tasks.len(),
            confidence = result.summary.confidence,
            "Discussion analyzed"
        );
        Ok(result)
    }
}

/// Client-side rejections are final; everything else may clear up on redelivery.
fn analysis_error(e: LlmError) -> AppError {
    let retryable = match &e {
        LlmError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => true,
    };
    AppError::external(SERVICE, e.to_string(), retryable)
}

/// Drops untitled tasks and pulls fields back into their allowed ranges.
pub fn sanitize(mut result: AnalysisResult) -> AnalysisResult {
    result.summary.confidence = result.summary.confidence.clamp(0.0, 1.0);
    result.tasks.retain(|t| !t.title.trim().is_empty());
    for task in &mut result.tasks {
        task.title = truncate_chars(task.title.trim(), TITLE_CHARS);
        let priority = task.priority.to_lowercase();
        task.priority = if PRIORITIES.contains(&priority.as_str()) {
            priority
        } else {
            "medium".to_string()
        };
    }
    result
}

/// Deterministic result for teams with AI turned off: the discussion itself
/// becomes one task.
pub fn fallback_analysis(discussion: &ParsedDiscussion, thread: &DiscussionThread) -> AnalysisResult {
    let title = if discussion.title.trim().is_empty() {
        discussion.content.lines().next().unwrap_or_default()
    } else {
        discussion.title.as_str()
    };
    AnalysisResult {
        summary: AiSummary {
            summary: truncate_chars(&discussion.content, 280),
            key_points: Vec::new(),
            sentiment: "neutral".to_string(),
            confidence: 1.0,
        },
        tasks: vec![DetectedTask {
            title: truncate_chars(title.trim(), TITLE_CHARS),
            description: format!("{}\n\nSource: {}", thread.transcript(), discussion.source_url),
            priority: "medium".to_string(),
            assignee: None,
            tags: vec![discussion.source_type.clone()],
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn discussion() -> ParsedDiscussion {
        ParsedDiscussion {
            source_type: "slack".into(),
            source_thread_id: "C1:1.0".into(),
            source_url: "https://slack.com/archives/C1/p10".into(),
            team_id: "T1".into(),
            author_handle: "U1".into(),
            title: "Can we update the dashboard by Friday?".into(),
            content: "Can we update the dashboard by Friday?".into(),
            participants: vec!["U1".into()],
            timestamp: Utc::now(),
            metadata: json!({}),
        }
    }

    #[test]
    fn test_fallback_is_one_deterministic_task() {
        let d = discussion();
        let thread = DiscussionThread::from_discussion(&d);
        let a = fallback_analysis(&d, &thread);
        let b = fallback_analysis(&d, &thread);
        assert_eq!(a, b);
        assert_eq!(a.tasks.len(), 1);
        assert_eq!(a.tasks[0].title, "Can we update the dashboard by Friday?");
        assert!(a.tasks[0].description.contains(&d.source_url));
    }

    #[test]
    fn test_sanitize_fixes_ranges() {
        let result = sanitize(AnalysisResult {
            summary: AiSummary {
                summary: "s".into(),
                key_points: vec![],
                sentiment: "neutral".into(),
                confidence: 1.7,
            },
            tasks: vec![
                DetectedTask {
                    title: "  ".into(),
                    description: String::new(),
                    priority: "high".into(),
                    assignee: None,
                    tags: vec![],
                },
                DetectedTask {
                    title: "Ship it".into(),
                    description: String::new(),
                    priority: "P0!!".into(),
                    assignee: None,
                    tags: vec![],
                },
            ],
        });
        assert_eq!(result.summary.confidence, 1.0);
        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].priority, "medium");
    }

    #[test]
    fn test_analysis_errors_keep_retryability() {
        let client_side = analysis_error(LlmError::Api {
            status: 400,
            message: "bad".into(),
        });
        assert!(!client_side.retryable());
        assert!(analysis_error(LlmError::EmptyContent).retryable());
    }
}
