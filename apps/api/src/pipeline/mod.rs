//! The processor: walks one discussion through the fixed stage sequence
//! `ingestion → config_load → thread_building → ai_analysis → task_creation
//! → notification`, recording every step on a [`Job`].
//!
//! A failed run is never rewound. [`Processor::retry`] starts a new job for
//! the same discussion, so each discussion keeps an append-only job log.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, SourceAdapter, StatusMarker, ThreadRef};
use crate::analysis::{fallback_analysis, Analyzer};
use crate::errors::{error_chain, AppError, PipelineError};
use crate::metrics::{Counter, Metrics};
use crate::models::discussion::{DiscussionRow, DiscussionStatus, DiscussionThread, ParsedDiscussion};
use crate::models::job::{Job, JobStage, JobStatus};
use crate::models::source_config::SourceConfig;
use crate::models::task::{AnalysisResult, ExternalTaskRef, TaskRow};
use crate::store::PipelineStore;
use crate::tasks::{TaskContext, TaskService};

#[derive(Debug, Clone, Copy)]
pub struct ProcessorOptions {
    /// Retries use the thread fetched by the failed job instead of fetching again.
    pub reuse_thread_on_retry: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            reuse_thread_on_retry: true,
        }
    }
}

/// Summary returned to the webhook sender or operator.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub job_id: Uuid,
    pub discussion_id: Uuid,
    pub status: JobStatus,
    pub task_ids: Vec<String>,
    pub summary: String,
    pub processing_time_ms: u64,
}

/// What a job starts from.
enum Input<'a> {
    /// A raw webhook payload, parsed during ingestion.
    Raw(&'a Value),
    /// A stored discussion being re-run.
    Retry(DiscussionRow),
}

/// Mutable state of one job run.
struct Run {
    job: Job,
    adapter: Arc<dyn SourceAdapter>,
    config: Option<SourceConfig>,
    discussion: Option<DiscussionRow>,
    /// Origin thread id, `None` until resolved or when it could not be.
    thread_id: Option<String>,
}

struct Finished {
    task_ids: Vec<String>,
    summary: String,
}

pub struct Processor {
    store: Arc<dyn PipelineStore>,
    adapters: AdapterRegistry,
    analyzer: Arc<dyn Analyzer>,
    tasks: Arc<dyn TaskService>,
    metrics: Metrics,
    options: ProcessorOptions,
}

impl Processor {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        adapters: AdapterRegistry,
        analyzer: Arc<dyn Analyzer>,
        tasks: Arc<dyn TaskService>,
        metrics: Metrics,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            store,
            adapters,
            analyzer,
            tasks,
            metrics,
            options,
        }
    }

    /// Runs a raw webhook payload through the whole pipeline. Parsing is part
    /// of ingestion, so a rejected payload still leaves a failed job behind.
    pub async fn process_payload(
        &self,
        source_type: &str,
        payload: &Value,
    ) -> Result<ProcessOutcome, PipelineError> {
        let adapter = self
            .adapters
            .require(source_type)
            .map_err(PipelineError::unrecorded)?;
        // The team is only known once the payload has been parsed.
        let job = Job::new("", source_type);
        self.run(job, adapter, Input::Raw(payload)).await
    }

    /// Re-runs a discussion under a new job linked to the previous one.
    pub async fn retry(&self, discussion_id: Uuid) -> Result<ProcessOutcome, PipelineError> {
        let discussion = self
            .store
            .get_discussion(discussion_id)
            .await
            .map_err(|e| PipelineError::unrecorded(AppError::Internal(e)))?
            .ok_or_else(|| {
                PipelineError::unrecorded(AppError::NotFound(format!(
                    "discussion {discussion_id} not found"
                )))
            })?;
        if discussion.status == DiscussionStatus::Completed {
            return Err(PipelineError::unrecorded(AppError::Validation(format!(
                "discussion {discussion_id} already completed"
            ))));
        }

        let history = self
            .store
            .jobs_for_discussion(discussion_id)
            .await
            .map_err(|e| PipelineError::unrecorded(AppError::Internal(e)))?;
        let job = match history.last() {
            Some(previous) if !previous.status.is_terminal() => {
                return Err(PipelineError::unrecorded(AppError::Validation(format!(
                    "job {} for this discussion is still {}",
                    previous.id,
                    previous.status.as_str()
                ))));
            }
            Some(previous) => Job::retry_of(previous, discussion_id),
            None => {
                let mut job = Job::new(&discussion.team_id, &discussion.source_type);
                job.status = JobStatus::Retrying;
                job.discussion_id = Some(discussion_id);
                job
            }
        };

        let adapter = self
            .adapters
            .require(&discussion.source_type)
            .map_err(PipelineError::unrecorded)?;
        self.run(job, adapter, Input::Retry(discussion)).await
    }

    async fn run(
        &self,
        job: Job,
        adapter: Arc<dyn SourceAdapter>,
        input: Input<'_>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let started = Instant::now();
        self.store.insert_job(&job).await.map_err(|e| {
            PipelineError::unrecorded(AppError::Internal(e.context("recording new job")))
        })?;
        info!(
            job_id = %job.id,
            source = %job.source_type,
            retry = job.status == JobStatus::Retrying,
            "Job started"
        );

        let mut run = Run {
            job,
            adapter,
            config: None,
            discussion: None,
            thread_id: None,
        };

        match self.stages(&mut run, input).await {
            Ok(finished) => Ok(self.complete(run, finished, started).await),
            Err(err) => Err(self.fail(run, err, started).await),
        }
    }

    async fn stages(&self, run: &mut Run, input: Input<'_>) -> Result<Finished, AppError> {
        let retrying = run.job.status == JobStatus::Retrying;
        run.job.status = JobStatus::Processing;
        self.save_job(&run.job).await;

        // ingestion
        let (parsed, existing) = match input {
            Input::Raw(payload) => (run.adapter.parse_incoming(payload).await?, None),
            Input::Retry(row) => (row.to_parsed(), Some(row)),
        };
        validate_discussion(&parsed, run.adapter.source_type())?;
        run.job.team_id = parsed.team_id.clone();

        // config_load
        self.advance(run, JobStage::ConfigLoad).await?;
        let config = self
            .store
            .find_active_config(&parsed.team_id, &parsed.source_type)
            .await
            .map_err(|e| storage_failure(JobStage::ConfigLoad, e))?
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "no active {} configuration for team {}",
                    parsed.source_type, parsed.team_id
                ))
            })?;
        run.job.source_config_id = Some(config.id);

        let discussion = match existing {
            Some(mut row) => {
                row.status = DiscussionStatus::Processing;
                row.completed_at = None;
                self.store
                    .update_discussion(&row)
                    .await
                    .map_err(|e| storage_failure(JobStage::ConfigLoad, e))?;
                row
            }
            None => {
                let row = DiscussionRow::from_parsed(&parsed);
                self.store
                    .insert_discussion(&row)
                    .await
                    .map_err(|e| storage_failure(JobStage::ConfigLoad, e))?;
                row
            }
        };
        run.job.discussion_id = Some(discussion.id);
        run.discussion = Some(discussion);
        run.config = Some(config.clone());
        self.save_job(&run.job).await;

        // thread_building
        self.advance(run, JobStage::ThreadBuilding).await?;
        let opening = if retrying {
            StatusMarker::Retrying
        } else {
            StatusMarker::ProcessingStarted
        };
        let cached = if retrying && self.options.reuse_thread_on_retry {
            run.discussion.as_ref().and_then(DiscussionRow::cached_thread)
        } else {
            None
        };
        let thread = match cached {
            Some(thread) => {
                if thread.metadata["synthetic"] != json!(true) {
                    run.thread_id = Some(thread.id.clone());
                }
                run.job.set_meta("thread_reused", json!(true));
                self.mark(run, opening).await;
                thread
            }
            None => self.build_thread(run, &parsed, &config, opening).await?,
        };
        if let Some(discussion) = run.discussion.as_mut() {
            discussion.thread_data = Some(to_json(&thread));
            if let Some(thread_id) = &run.thread_id {
                discussion.source_thread_id = thread_id.clone();
                if let Ok(thread_ref) = ThreadRef::parse(thread_id) {
                    discussion.source_url = run.adapter.deep_link(&thread_ref);
                }
            }
            self.store
                .update_discussion(discussion)
                .await
                .map_err(|e| storage_failure(JobStage::ThreadBuilding, e))?;
        }
        run.job.set_meta("message_count", json!(thread.message_count()));

        // ai_analysis
        self.advance(run, JobStage::AiAnalysis).await?;
        self.mark(run, StatusMarker::Analyzing).await;
        let analysis = if config.ai_enabled {
            self.analyzer.analyze(&parsed, &thread).await?
        } else {
            debug!(job_id = %run.job.id, "AI disabled for team, using fallback analysis");
            fallback_analysis(&parsed, &thread)
        };
        if let Some(discussion) = run.discussion.as_mut() {
            discussion.ai_summary = Some(to_json(&analysis.summary));
            discussion.ai_action_items = Some(to_json(&analysis.tasks));
            self.store
                .update_discussion(discussion)
                .await
                .map_err(|e| storage_failure(JobStage::AiAnalysis, e))?;
        }
        run.job.set_meta("tasks_detected", json!(analysis.tasks.len()));

        // task_creation
        self.advance(run, JobStage::TaskCreation).await?;
        let refs = self.create_tasks(run, &parsed, &analysis, &config).await?;
        let task_ids: Vec<String> = refs.iter().map(|r| r.id.clone()).collect();
        self.metrics.add(Counter::TasksCreated, refs.len() as u64).await;

        // notification
        self.advance(run, JobStage::Notification).await?;
        if let Some(thread_id) = run.thread_id.clone() {
            let reply = reply_text(&analysis, &refs);
            if let Err(e) = run.adapter.post_reply(&thread_id, &reply, &config).await {
                warn!(job_id = %run.job.id, "Failed to post reply: {e}");
            }
        }
        self.mark(run, StatusMarker::Success).await;

        if let Some(discussion) = run.discussion.as_mut() {
            discussion.status = DiscussionStatus::Completed;
            discussion.created_task_ids = task_ids.clone();
            discussion.completed_at = Some(chrono::Utc::now());
            if let Err(e) = self.store.update_discussion(discussion).await {
                warn!(job_id = %run.job.id, "Failed to mark discussion completed: {e}");
            }
        }

        Ok(Finished {
            task_ids,
            summary: analysis.summary.summary,
        })
    }

    /// Locates the origin thread and fetches it, or falls back to a
    /// one-message thread when the adapter cannot locate it.
    async fn build_thread(
        &self,
        run: &mut Run,
        parsed: &ParsedDiscussion,
        config: &SourceConfig,
        opening: StatusMarker,
    ) -> Result<DiscussionThread, AppError> {
        let Some(thread_id) = run.adapter.resolve_thread_id(parsed, config).await? else {
            info!(job_id = %run.job.id, "Origin thread not found, using the discussion itself");
            run.job.set_meta("thread_synthetic", json!(true));
            return Ok(DiscussionThread::from_discussion(parsed));
        };
        run.thread_id = Some(thread_id.clone());
        self.mark(run, opening).await;
        run.adapter.fetch_thread(&thread_id, config).await
    }

    /// Creates every external task, then links them all locally in one write.
    /// If any step fails, the tasks already created are archived again so a
    /// failed run leaves nothing behind for the retry to duplicate.
    async fn create_tasks(
        &self,
        run: &mut Run,
        parsed: &ParsedDiscussion,
        analysis: &AnalysisResult,
        config: &SourceConfig,
    ) -> Result<Vec<ExternalTaskRef>, AppError> {
        let total = analysis.tasks.len();
        if total == 0 {
            info!(job_id = %run.job.id, "No action items detected");
            return Ok(Vec::new());
        }
        let Some(discussion_id) = run.job.discussion_id else {
            return Err(AppError::Internal(anyhow::anyhow!(
                "task creation reached without a discussion"
            )));
        };

        let mut refs = Vec::with_capacity(total);
        for (index, task) in analysis.tasks.iter().enumerate() {
            let context = TaskContext {
                discussion: parsed,
                summary: &analysis.summary.summary,
                position: (total > 1).then_some((index, total)),
            };
            match self.tasks.create_task(task, context, config).await {
                Ok(external) => refs.push(external),
                Err(e) => {
                    self.discard_tasks(run, &refs, config).await;
                    return Err(e);
                }
            }
        }

        let now = chrono::Utc::now();
        let rows: Vec<TaskRow> = refs
            .iter()
            .zip(&analysis.tasks)
            .enumerate()
            .map(|(index, (external, task))| TaskRow {
                id: Uuid::new_v4(),
                discussion_id,
                job_id: run.job.id,
                external_id: external.id.clone(),
                external_url: external.url.clone(),
                title: task.title.clone(),
                priority: task.priority.clone(),
                task_index: (total > 1).then_some(index as i32),
                created_at: now,
            })
            .collect();
        if let Err(e) = self.store.insert_tasks(&rows).await {
            self.discard_tasks(run, &refs, config).await;
            return Err(storage_failure(JobStage::TaskCreation, e));
        }
        info!(job_id = %run.job.id, count = rows.len(), "Tasks created");
        Ok(refs)
    }

    /// Best-effort rollback of external tasks. Ids that could not be archived
    /// stay on the job so an operator can remove them by hand.
    async fn discard_tasks(&self, run: &mut Run, refs: &[ExternalTaskRef], config: &SourceConfig) {
        if refs.is_empty() {
            return;
        }
        let mut orphaned = Vec::new();
        for external in refs {
            if let Err(e) = self.tasks.archive_task(external, config).await {
                warn!(job_id = %run.job.id, task = %external.id, "Failed to archive task: {e}");
                orphaned.push(external.id.clone());
            }
        }
        let archived: Vec<&str> = refs
            .iter()
            .map(|r| r.id.as_str())
            .filter(|id| !orphaned.iter().any(|o| o == id))
            .collect();
        info!(job_id = %run.job.id, archived = archived.len(), "Rolled back partial task set");
        run.job.set_meta("archived_task_ids", json!(archived));
        if !orphaned.is_empty() {
            run.job.set_meta("orphaned_task_ids", json!(orphaned));
        }
    }

    async fn advance(&self, run: &mut Run, stage: JobStage) -> Result<(), AppError> {
        run.job
            .advance_to(stage)
            .map_err(|e| AppError::Internal(e.into()))?;
        debug!(job_id = %run.job.id, stage = %stage, "Stage entered");
        self.save_job(&run.job).await;
        Ok(())
    }

    async fn complete(&self, mut run: Run, finished: Finished, started: Instant) -> ProcessOutcome {
        let elapsed = started.elapsed().as_millis() as u64;
        run.job.set_meta("processing_time_ms", json!(elapsed));
        run.job.set_meta("created_task_ids", json!(finished.task_ids));
        run.job.mark_completed();
        self.save_job(&run.job).await;
        self.metrics.incr(Counter::JobsCompleted).await;
        info!(
            job_id = %run.job.id,
            team = %run.job.team_id,
            tasks = finished.task_ids.len(),
            elapsed_ms = elapsed,
            "Job completed"
        );

        ProcessOutcome {
            job_id: run.job.id,
            discussion_id: run.job.discussion_id.unwrap_or_default(),
            status: run.job.status,
            task_ids: finished.task_ids,
            summary: finished.summary,
            processing_time_ms: elapsed,
        }
    }

    async fn fail(&self, mut run: Run, err: AppError, started: Instant) -> PipelineError {
        let stage = run.job.stage;
        let stack = error_chain(&err);
        let err = err.at_stage(stage);
        let retryable = err.retryable();

        run.job.set_meta("processing_time_ms", json!(started.elapsed().as_millis() as u64));
        run.job.mark_failed(err.to_string(), stack, retryable);
        self.save_job(&run.job).await;

        if let Some(discussion) = run.discussion.as_mut() {
            discussion.status = DiscussionStatus::Failed;
            discussion.completed_at = Some(chrono::Utc::now());
            if let Err(e) = self.store.update_discussion(discussion).await {
                warn!(job_id = %run.job.id, "Failed to mark discussion failed: {e}");
            }
        }
        self.mark(&run, StatusMarker::Error).await;
        self.metrics.incr(Counter::JobsFailed).await;

        error!(
            job_id = %run.job.id,
            team = %run.job.team_id,
            source = %run.job.source_type,
            stage = %stage,
            retryable,
            "Job failed: {err}"
        );
        PipelineError {
            job_id: Some(run.job.id),
            source: err,
        }
    }

    /// Job writes after the initial insert never fail the run.
    async fn save_job(&self, job: &Job) {
        if let Err(e) = self.store.update_job(job).await {
            warn!(job_id = %job.id, stage = %job.stage, "Failed to update job: {e}");
        }
    }

    /// Shows a status marker on the origin thread, if it is known.
    async fn mark(&self, run: &Run, marker: StatusMarker) {
        let (Some(thread_id), Some(config)) = (&run.thread_id, &run.config) else {
            return;
        };
        if let Err(e) = run.adapter.update_status(thread_id, marker, config).await {
            warn!(
                job_id = %run.job.id,
                marker = marker.as_str(),
                "Failed to update status marker: {e}"
            );
        }
    }
}

/// Structural checks run at ingestion.
fn validate_discussion(parsed: &ParsedDiscussion, source_type: &str) -> Result<(), AppError> {
    let required = [
        ("source_type", &parsed.source_type),
        ("source_thread_id", &parsed.source_thread_id),
        ("team_id", &parsed.team_id),
        ("content", &parsed.content),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(AppError::Validation(format!("discussion is missing {field}")));
        }
    }
    if parsed.source_type != source_type {
        return Err(AppError::Validation(format!(
            "discussion from '{}' routed to the '{source_type}' adapter",
            parsed.source_type
        )));
    }
    ThreadRef::parse(&parsed.source_thread_id)?;
    Ok(())
}

fn storage_failure(stage: JobStage, e: anyhow::Error) -> AppError {
    AppError::Processing {
        stage,
        message: format!("storage failure: {e:#}"),
        retryable: true,
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Reply posted on the origin thread once tasks exist.
fn reply_text(analysis: &AnalysisResult, refs: &[ExternalTaskRef]) -> String {
    if refs.is_empty() {
        return format!(
            "No action items found. Summary: {}",
            analysis.summary.summary
        );
    }
    let mut lines = vec![format!(
        "Created {} task{}:",
        refs.len(),
        if refs.len() == 1 { "" } else { "s" }
    )];
    for (task, external) in analysis.tasks.iter().zip(refs) {
        match &external.url {
            Some(url) => lines.push(format!("• {} ({url})", task.title)),
            None => lines.push(format!("• {}", task.title)),
        }
    }
    lines.join("\n")
}
