//! Records the pipeline reads and writes: source configs, discussions,
//! jobs and task links.
//!
//! Jobs are append-only: `insert_job` adds a row, `update_job` only ever
//! rewrites the row it is given.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::discussion::DiscussionRow;
use crate::models::job::Job;
use crate::models::source_config::SourceConfig;
use crate::models::task::TaskRow;

pub use self::memory::MemoryPipelineStore;
pub use self::postgres::PgPipelineStore;

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// The active config for a team on a platform, if there is one.
    async fn find_active_config(
        &self,
        team_id: &str,
        source_type: &str,
    ) -> Result<Option<SourceConfig>>;

    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Every job recorded for a discussion, oldest first.
    async fn jobs_for_discussion(&self, discussion_id: Uuid) -> Result<Vec<Job>>;

    async fn insert_discussion(&self, discussion: &DiscussionRow) -> Result<()>;

    async fn update_discussion(&self, discussion: &DiscussionRow) -> Result<()>;

    async fn get_discussion(&self, id: Uuid) -> Result<Option<DiscussionRow>>;

    /// Stores every row or none of them.
    async fn insert_tasks(&self, tasks: &[TaskRow]) -> Result<()>;
}
