use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Summary produced by the analysis service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiSummary {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default = "default_sentiment")]
    pub sentiment: String,
    #[serde(default)]
    pub confidence: f64,
}

fn default_sentiment() -> String {
    "neutral".to_string()
}

/// An actionable item found in a discussion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_priority() -> String {
    "medium".to_string()
}

/// Full output of the `ai_analysis` stage. An empty task list is a valid result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub summary: AiSummary,
    #[serde(default)]
    pub tasks: Vec<DetectedTask>,
}

/// Reference to a record created in the task-management system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalTaskRef {
    pub id: String,
    pub url: Option<String>,
}

/// Local row linking a discussion and job to one external task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub discussion_id: Uuid,
    pub job_id: Uuid,
    pub external_id: String,
    pub external_url: Option<String>,
    pub title: String,
    pub priority: String,
    /// Position within a multi-task discussion, `None` for single-task ones.
    pub task_index: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detected_task_fills_defaults() {
        let task: DetectedTask =
            serde_json::from_str(r#"{"title": "Update the dashboard"}"#).unwrap();
        assert_eq!(task.priority, "medium");
        assert!(task.tags.is_empty());
        assert!(task.assignee.is_none());
    }

    #[test]
    fn test_analysis_without_tasks_is_valid() {
        let result: AnalysisResult =
            serde_json::from_str(r#"{"summary": {"summary": "All good"}}"#).unwrap();
        assert!(result.tasks.is_empty());
        assert_eq!(result.summary.sentiment, "neutral");
    }
}
