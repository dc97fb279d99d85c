use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

use crate::analysis::{content_preview, count_text, decode_text, embedding_input};
use crate::db::Database;
use crate::embedding::{check_embedding, Embedder};
use crate::error::{EmbedError, ProcessingError, StoreError};
use crate::events::{AuditSink, TaskEvent, CATEGORY_PROCESSING};
use crate::models::{
    AnalysisMetrics, AnalysisResult, Task, TaskStatus, EMBED_MAX_CHARS, PREVIEW_MAX_CHARS,
};
use crate::queue::{Job, JobHandle, JobQueue};
use crate::storage::StorageResolver;

/// Upper bound on one embedding call. Kept well below the default job lease.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    pub embed_max_chars: usize,
    pub preview_max_chars: usize,
    pub embed_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            embed_max_chars: EMBED_MAX_CHARS,
            preview_max_chars: PREVIEW_MAX_CHARS,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }
}

/// How one delivered job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { embedded: bool },
    Failed { error: String },
    /// The record was already terminal: a redelivery, nothing was touched.
    Redundant(TaskStatus),
    /// The job points at a record that does not exist.
    MissingTask,
}

/// Drives one task through `queued -> processing -> completed | failed`.
#[derive(Clone)]
pub struct TaskProcessor {
    db: Database,
    storage: Arc<dyn StorageResolver>,
    embedder: Arc<dyn Embedder>,
    audit: Arc<dyn AuditSink>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(
        db: Database,
        storage: Arc<dyn StorageResolver>,
        embedder: Arc<dyn Embedder>,
        audit: Arc<dyn AuditSink>,
        config: ProcessorConfig,
    ) -> Self {
        TaskProcessor {
            db,
            storage,
            embedder,
            audit,
            config,
        }
    }

    /// Runs a single attempt. Nothing is retried here; an `Err` means the
    /// record could not be read or moved to `processing` at all.
    pub async fn process(&self, job: &Job) -> Result<JobOutcome, StoreError> {
        let Some(task) = self.db.get_task(&job.task_id)? else {
            tracing::error!(task_id = %job.task_id, job = %job.handle, "task not found, dropping job");
            return Ok(JobOutcome::MissingTask);
        };

        if task.status().is_terminal() {
            tracing::warn!(
                task_id = %task.id,
                status = %task.status(),
                attempt = job.attempt,
                "redundant delivery, task already finished"
            );
            return Ok(JobOutcome::Redundant(task.status()));
        }

        self.db.mark_task_processing(&task.id)?;
        tracing::info!(task_id = %task.id, attempt = job.attempt, "processing task");
        self.audit.record(
            CATEGORY_PROCESSING,
            TaskEvent::new(&task.id, TaskStatus::Processing).owner(&task.owner_id),
        );

        let attempt = match self.analyze(&task, &job.input_ref).await {
            Ok(result) => match self.db.mark_task_completed(&task.id, &result) {
                Ok(_) => Ok(result),
                Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                    tracing::warn!(task_id = %task.id, status = %from, "task finished by another delivery");
                    return Ok(JobOutcome::Redundant(from));
                }
                Err(e) => Err(ProcessingError::Store(e)),
            },
            Err(e) => Err(e),
        };

        match attempt {
            Ok(result) => {
                let embedded = result.embedding.is_some();
                tracing::info!(
                    task_id = %task.id,
                    lines = result.metrics.line_count,
                    words = result.metrics.word_count,
                    chars = result.metrics.character_count,
                    embedded,
                    "task completed"
                );
                self.audit.record(
                    CATEGORY_PROCESSING,
                    TaskEvent::new(&task.id, TaskStatus::Completed)
                        .owner(&task.owner_id)
                        .detail(serde_json::json!({
                            "metrics": result.metrics,
                            "embedded": embedded,
                        })),
                );
                Ok(JobOutcome::Completed { embedded })
            }
            Err(e) => {
                // Details stay in the log; the record gets a fixed message
                tracing::error!(task_id = %task.id, attempt = job.attempt, "task failed: {}", e);
                let error = e.public_message().to_string();

                match self.db.mark_task_failed(&task.id, &error) {
                    Ok(_) => {}
                    Err(StoreError::InvalidTransition { from, .. }) if from.is_terminal() => {
                        return Ok(JobOutcome::Redundant(from));
                    }
                    Err(store_err) => {
                        tracing::error!(task_id = %task.id, "failed to update task status: {}", store_err);
                        return Err(store_err);
                    }
                }

                self.audit.record(
                    CATEGORY_PROCESSING,
                    TaskEvent::new(&task.id, TaskStatus::Failed)
                        .owner(&task.owner_id)
                        .detail(serde_json::json!({ "error": error })),
                );
                Ok(JobOutcome::Failed { error })
            }
        }
    }

    /// Metrics are the deliverable; the embedding is best-effort and its
    /// failure only leaves the result without one.
    async fn analyze(&self, task: &Task, input_ref: &str) -> Result<AnalysisResult, ProcessingError> {
        let started = Instant::now();

        let bytes = self.storage.resolve(input_ref).await?;
        let text = decode_text(&bytes);
        let counts = count_text(&text);

        let input = embedding_input(&text, self.config.embed_max_chars);
        let embedded = match timeout(
            self.config.embed_timeout,
            self.embedder.embed(input, self.config.embed_max_chars),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EmbedError::Timeout(self.config.embed_timeout)),
        };

        let embedding = match embedded.and_then(check_embedding) {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(task_id = %task.id, "embedding failed, completing without it: {}", e);
                None
            }
        };

        let metrics = AnalysisMetrics {
            file_size: task.file_size,
            line_count: counts.lines,
            word_count: counts.words,
            character_count: counts.characters,
            processing_time_ms: started.elapsed().as_millis() as u64,
            analyzed_at: Utc::now(),
        };

        Ok(AnalysisResult {
            metrics,
            embedding,
            content_preview: content_preview(&text, self.config.preview_max_chars),
        })
    }
}

/// Dequeue-process loop. Settles every delivered job with the queue and
/// returns once `shutdown` flips, after finishing the job in hand.
pub async fn run_worker(
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    processor: TaskProcessor,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(worker = %worker_id, "worker started, waiting for jobs...");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            job = queue.dequeue(&worker_id) => job,
        };

        let job = match job {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(worker = %worker_id, "failed to fetch job: {}", e);
                sleep(Duration::from_millis(1000)).await;
                continue;
            }
        };

        let processed = tokio::select! {
            result = processor.process(&job) => Some(result),
            _ = hold_lease(queue.as_ref(), &job.handle, &worker_id) => None,
        };
        let Some(processed) = processed else {
            // Someone else may own the job now; leave the task to them
            tracing::warn!(worker = %worker_id, job = %job.handle, task_id = %job.task_id, "lease lost, abandoning attempt");
            continue;
        };

        let settled = match processed {
            Ok(JobOutcome::Completed { .. }) | Ok(JobOutcome::Redundant(_)) => {
                queue.ack(&job.handle, &worker_id).await
            }
            Ok(JobOutcome::Failed { error }) => queue.fail(&job.handle, &worker_id, &error).await,
            Ok(JobOutcome::MissingTask) => {
                queue
                    .fail(&job.handle, &worker_id, "task record not found")
                    .await
            }
            Err(e) => {
                tracing::error!(worker = %worker_id, task_id = %job.task_id, "job aborted: {}", e);
                queue.fail(&job.handle, &worker_id, &e.to_string()).await
            }
        };

        if let Err(e) = settled {
            tracing::error!(worker = %worker_id, job = %job.handle, "failed to settle job: {}", e);
        }
    }

    tracing::info!(worker = %worker_id, "worker stopped");
}

/// Renews the lease every third of its length while an attempt runs.
/// Returns only once the lease is gone.
async fn hold_lease(queue: &dyn JobQueue, handle: &JobHandle, worker_id: &str) {
    let every = (queue.lease() / 3).max(Duration::from_millis(1));
    loop {
        sleep(every).await;
        match queue.extend_lease(handle, worker_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => tracing::error!(worker = worker_id, job = %handle, "failed to extend lease: {}", e),
        }
    }
}
