use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            _ => Err(UnknownVariant::new("job status", value)),
        }
    }
}

/// Pipeline stages in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Ingestion,
    ConfigLoad,
    ThreadBuilding,
    AiAnalysis,
    TaskCreation,
    Notification,
}

impl JobStage {
    pub const ALL: [JobStage; 6] = [
        JobStage::Ingestion,
        JobStage::ConfigLoad,
        JobStage::ThreadBuilding,
        JobStage::AiAnalysis,
        JobStage::TaskCreation,
        JobStage::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Ingestion => "ingestion",
            JobStage::ConfigLoad => "config_load",
            JobStage::ThreadBuilding => "thread_building",
            JobStage::AiAnalysis => "ai_analysis",
            JobStage::TaskCreation => "task_creation",
            JobStage::Notification => "notification",
        }
    }

    /// The stage that follows this one, `None` after notification.
    pub fn next(&self) -> Option<JobStage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobStage {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .find(|s| s.as_str() == value)
            .copied()
            .ok_or_else(|| UnknownVariant::new("job stage", value))
    }
}

/// Attempted to move a job anywhere but one stage forward.
#[derive(Debug, thiserror::Error)]
#[error("illegal stage transition {from} -> {to}")]
pub struct StageTransitionError {
    pub from: JobStage,
    pub to: JobStage,
}

/// Durable record of one attempt at processing a discussion.
///
/// Jobs are append-only per discussion: a retry inserts a new row,
/// it never rewinds the stage of an existing one.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub team_id: String,
    pub source_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    #[sqlx(try_from = "String")]
    pub stage: JobStage,
    pub discussion_id: Option<Uuid>,
    pub source_config_id: Option<Uuid>,
    pub attempts: i32,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl Job {
    pub fn new(team_id: &str, source_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id: team_id.to_string(),
            source_type: source_type.to_string(),
            status: JobStatus::Pending,
            stage: JobStage::Ingestion,
            discussion_id: None,
            source_config_id: None,
            attempts: 1,
            error: None,
            error_stack: None,
            started_at: Utc::now(),
            completed_at: None,
            metadata: json!({}),
        }
    }

    /// A fresh job for an existing discussion, linked to the job it replaces.
    pub fn retry_of(previous: &Job, discussion_id: Uuid) -> Self {
        let mut job = Self::new(&previous.team_id, &previous.source_type);
        job.status = JobStatus::Retrying;
        job.discussion_id = Some(discussion_id);
        job.set_meta("retry_of", json!(previous.id));
        job
    }

    /// Moves exactly one stage forward.
    pub fn advance_to(&mut self, stage: JobStage) -> Result<(), StageTransitionError> {
        if self.stage.next() != Some(stage) {
            return Err(StageTransitionError {
                from: self.stage,
                to: stage,
            });
        }
        self.stage = stage;
        Ok(())
    }

    pub fn set_meta(&mut self, key: &str, value: Value) {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        self.metadata[key] = value;
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String, error_stack: String, retryable: bool) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.error_stack = Some(error_stack);
        self.completed_at = Some(Utc::now());
        self.set_meta("retryable", json!(retryable));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(JobStage::Ingestion.next(), Some(JobStage::ConfigLoad));
        assert_eq!(JobStage::TaskCreation.next(), Some(JobStage::Notification));
        assert_eq!(JobStage::Notification.next(), None);
    }

    #[test]
    fn test_advance_rejects_skips_and_rewinds() {
        let mut job = Job::new("T1", "slack");
        assert!(job.advance_to(JobStage::ThreadBuilding).is_err());
        job.advance_to(JobStage::ConfigLoad).unwrap();
        assert!(job.advance_to(JobStage::Ingestion).is_err());
        assert!(job.advance_to(JobStage::ConfigLoad).is_err());
        assert_eq!(job.stage, JobStage::ConfigLoad);
    }

    #[test]
    fn test_retry_is_a_new_row_with_reset_attempts() {
        let mut first = Job::new("T1", "slack");
        first.attempts = 1;
        first.mark_failed("timeout".into(), "timeout".into(), true);
        let discussion = Uuid::new_v4();
        let retry = Job::retry_of(&first, discussion);
        assert_ne!(retry.id, first.id);
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.stage, JobStage::Ingestion);
        assert_eq!(retry.metadata["retry_of"], json!(first.id));
        assert!(retry.error.is_none());
    }

    #[test]
    fn test_stage_round_trips_through_text() {
        for stage in JobStage::ALL {
            assert_eq!(JobStage::try_from(stage.as_str().to_string()).unwrap(), stage);
        }
    }
}
