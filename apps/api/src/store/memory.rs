//! In-memory [`PipelineStore`] for single-instance runs and tests.
//!
//! One `std::sync::Mutex` guards all tables; no lock is held across an await.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::PipelineStore;
use crate::models::discussion::DiscussionRow;
use crate::models::job::Job;
use crate::models::source_config::SourceConfig;
use crate::models::task::TaskRow;

#[derive(Default)]
struct Tables {
    configs: Vec<SourceConfig>,
    discussions: HashMap<Uuid, DiscussionRow>,
    jobs: Vec<Job>,
    tasks: Vec<TaskRow>,
}

#[derive(Default)]
pub struct MemoryPipelineStore {
    tables: Mutex<Tables>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a source config; the config store itself lives elsewhere.
    pub fn add_config(&self, config: SourceConfig) {
        if let Ok(mut t) = self.tables.lock() {
            t.configs.push(config);
        }
    }

    pub fn tasks(&self) -> Vec<TaskRow> {
        self.tables
            .lock()
            .map(|t| t.tasks.clone())
            .unwrap_or_default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.tables
            .lock()
            .map(|t| t.jobs.clone())
            .unwrap_or_default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| anyhow!("pipeline store lock poisoned"))?;
        f(&mut tables)
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn find_active_config(
        &self,
        team_id: &str,
        source_type: &str,
    ) -> Result<Option<SourceConfig>> {
        self.with(|t| {
            Ok(t.configs
                .iter()
                .find(|c| c.active && c.team_id == team_id && c.source_type == source_type)
                .cloned())
        })
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.with(|t| {
            if t.jobs.iter().any(|j| j.id == job.id) {
                bail!("job {} already exists", job.id);
            }
            t.jobs.push(job.clone());
            Ok(())
        })
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.with(|t| {
            let row = t
                .jobs
                .iter_mut()
                .find(|j| j.id == job.id)
                .ok_or_else(|| anyhow!("job {} not found", job.id))?;
            *row = job.clone();
            Ok(())
        })
    }

    async fn jobs_for_discussion(&self, discussion_id: Uuid) -> Result<Vec<Job>> {
        self.with(|t| {
            let mut jobs: Vec<Job> = t
                .jobs
                .iter()
                .filter(|j| j.discussion_id == Some(discussion_id))
                .cloned()
                .collect();
            jobs.sort_by_key(|j| j.started_at);
            Ok(jobs)
        })
    }

    async fn insert_discussion(&self, discussion: &DiscussionRow) -> Result<()> {
        self.with(|t| {
            t.discussions.insert(discussion.id, discussion.clone());
            Ok(())
        })
    }

    async fn update_discussion(&self, discussion: &DiscussionRow) -> Result<()> {
        self.with(|t| match t.discussions.get_mut(&discussion.id) {
            Some(row) => {
                *row = discussion.clone();
                Ok(())
            }
            None => bail!("discussion {} not found", discussion.id),
        })
    }

    async fn get_discussion(&self, id: Uuid) -> Result<Option<DiscussionRow>> {
        self.with(|t| Ok(t.discussions.get(&id).cloned()))
    }

    async fn insert_tasks(&self, tasks: &[TaskRow]) -> Result<()> {
        self.with(|t| {
            // Check everything first so a bad row leaves the table untouched.
            for task in tasks {
                if !t.discussions.contains_key(&task.discussion_id) {
                    bail!("task {} references unknown discussion", task.id);
                }
                if t.tasks.iter().any(|existing| existing.id == task.id) {
                    bail!("task {} already exists", task.id);
                }
            }
            t.tasks.extend_from_slice(tasks);
            Ok(())
        })
    }
}
