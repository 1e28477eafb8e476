//! Postgres-backed [`PipelineStore`].
//!
//! Tables: `source_configs`, `discussions`, `jobs`, `tasks`. Enum columns are
//! stored as their snake_case text and read back through `TryFrom<String>`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::PipelineStore;
use crate::models::discussion::DiscussionRow;
use crate::models::job::Job;
use crate::models::source_config::SourceConfig;
use crate::models::task::TaskRow;

#[derive(Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn find_active_config(
        &self,
        team_id: &str,
        source_type: &str,
    ) -> Result<Option<SourceConfig>> {
        let config = sqlx::query_as::<_, SourceConfig>(
            r#"
            SELECT * FROM source_configs
            WHERE team_id = $1 AND source_type = $2 AND active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(team_id)
        .bind(source_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, team_id, source_type, status, stage, discussion_id, source_config_id,
                 attempts, error, error_stack, started_at, completed_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(&job.team_id)
        .bind(&job.source_type)
        .bind(job.status.as_str())
        .bind(job.stage.as_str())
        .bind(job.discussion_id)
        .bind(job.source_config_id)
        .bind(job.attempts)
        .bind(&job.error)
        .bind(&job.error_stack)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting job {}", job.id))?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, stage = $3, discussion_id = $4, source_config_id = $5,
                attempts = $6, error = $7, error_stack = $8, completed_at = $9, metadata = $10
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.stage.as_str())
        .bind(job.discussion_id)
        .bind(job.source_config_id)
        .bind(job.attempts)
        .bind(&job.error)
        .bind(&job.error_stack)
        .bind(job.completed_at)
        .bind(&job.metadata)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating job {}", job.id))?;
        Ok(())
    }

    async fn jobs_for_discussion(&self, discussion_id: Uuid) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE discussion_id = $1 ORDER BY started_at ASC",
        )
        .bind(discussion_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_discussion(&self, d: &DiscussionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discussions
                (id, source_type, source_thread_id, source_url, team_id, author_handle, title,
                 content, participants, timestamp, metadata, status, thread_data, ai_summary,
                 ai_action_items, created_task_ids, created_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(d.id)
        .bind(&d.source_type)
        .bind(&d.source_thread_id)
        .bind(&d.source_url)
        .bind(&d.team_id)
        .bind(&d.author_handle)
        .bind(&d.title)
        .bind(&d.content)
        .bind(&d.participants)
        .bind(d.timestamp)
        .bind(&d.metadata)
        .bind(d.status.as_str())
        .bind(&d.thread_data)
        .bind(&d.ai_summary)
        .bind(&d.ai_action_items)
        .bind(&d.created_task_ids)
        .bind(d.created_at)
        .bind(d.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting discussion {}", d.id))?;
        Ok(())
    }

    async fn update_discussion(&self, d: &DiscussionRow) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE discussions
            SET source_thread_id = $2, source_url = $3, status = $4, thread_data = $5,
                ai_summary = $6, ai_action_items = $7, created_task_ids = $8, completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(d.id)
        .bind(&d.source_thread_id)
        .bind(&d.source_url)
        .bind(d.status.as_str())
        .bind(&d.thread_data)
        .bind(&d.ai_summary)
        .bind(&d.ai_action_items)
        .bind(&d.created_task_ids)
        .bind(d.completed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating discussion {}", d.id))?;
        Ok(())
    }

    async fn get_discussion(&self, id: Uuid) -> Result<Option<DiscussionRow>> {
        Ok(
            sqlx::query_as::<_, DiscussionRow>("SELECT * FROM discussions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn insert_tasks(&self, tasks: &[TaskRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks
                    (id, discussion_id, job_id, external_id, external_url, title, priority,
                     task_index, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(task.id)
            .bind(task.discussion_id)
            .bind(task.job_id)
            .bind(&task.external_id)
            .bind(&task.external_url)
            .bind(&task.title)
            .bind(&task.priority)
            .bind(task.task_index)
            .bind(task.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting task {}", task.id))?;
        }
        tx.commit().await?;
        Ok(())
    }
}
