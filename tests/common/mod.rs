#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doc_analyzer::db::Database;
use doc_analyzer::embedding::{Embedder, HashEmbedder};
use doc_analyzer::error::EmbedError;
use doc_analyzer::events::{AuditSink, EventLog};
use doc_analyzer::gateway::TaskGateway;
use doc_analyzer::models::EMBEDDING_DIM;
use doc_analyzer::query::QueryService;
use doc_analyzer::queue::{Job, JobQueue, QueueConfig, SqliteJobQueue};
use doc_analyzer::storage::{LocalStorage, StorageResolver};
use doc_analyzer::worker::{JobOutcome, ProcessorConfig, TaskProcessor};
use tempfile::TempDir;

/// Embedder that is always down.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str, _max_chars: usize) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Unavailable("model not loaded".to_string()))
    }
}

/// Sleeps before answering and records how many calls overlap.
#[derive(Default)]
pub struct SlowEmbedder {
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        SlowEmbedder {
            delay,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, text: &str, _max_chars: usize) -> Result<Vec<f32>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(HashEmbedder.embed_sync(text))
    }
}

/// Returns a vector with a NaN component.
pub struct NanEmbedder;

#[async_trait]
impl Embedder for NanEmbedder {
    async fn embed(&self, _text: &str, _max_chars: usize) -> Result<Vec<f32>, EmbedError> {
        let mut embedding = vec![0.1_f32; EMBEDDING_DIM];
        embedding[0] = f32::NAN;
        Ok(embedding)
    }
}

/// Everything a submit-then-process round needs, backed by temp files.
pub struct Harness {
    pub _temp_dir: TempDir,
    pub db: Database,
    pub queue: Arc<SqliteJobQueue>,
    pub storage: LocalStorage,
    pub events: EventLog,
    pub gateway: TaskGateway,
    pub query: QueryService,
    pub processor: TaskProcessor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_embedder(Arc::new(HashEmbedder))
    }

    pub fn with_embedder(embedder: Arc<dyn Embedder>) -> Self {
        Self::build(
            embedder,
            QueueConfig {
                lease: Duration::from_secs(60),
                poll_interval: Duration::from_millis(20),
            },
            ProcessorConfig::default(),
        )
    }

    pub fn build(
        embedder: Arc<dyn Embedder>,
        queue_config: QueueConfig,
        processor_config: ProcessorConfig,
    ) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(temp_dir.path().join("tasks.db")).unwrap();
        let queue = Arc::new(
            SqliteJobQueue::new(temp_dir.path().join("queue.db"), queue_config).unwrap(),
        );
        let storage = LocalStorage::new(temp_dir.path().join("uploads"));
        let events = EventLog::new(db.clone(), 16);
        let audit: Arc<dyn AuditSink> = Arc::new(events.clone());
        let resolver: Arc<dyn StorageResolver> = Arc::new(storage.clone());

        let gateway = TaskGateway::new(db.clone(), queue.clone(), audit.clone());
        let processor = TaskProcessor::new(
            db.clone(),
            resolver,
            embedder,
            audit,
            processor_config,
        );

        Harness {
            _temp_dir: temp_dir,
            query: QueryService::new(db.clone()),
            db,
            queue,
            storage,
            events,
            gateway,
            processor,
        }
    }

    /// Stores `content` and submits it as `owner`. Returns the task id.
    pub async fn upload(&self, owner: &str, filename: &str, content: &str) -> String {
        let input_ref = self.storage.store(filename, content.as_bytes()).await.unwrap();
        self.gateway
            .submit(owner, filename, content.len() as u64, &input_ref)
            .await
            .unwrap()
    }

    pub async fn next_job(&self) -> Job {
        self.queue.try_dequeue("test-worker").await.unwrap().unwrap()
    }

    /// Uploads and runs the job to completion.
    pub async fn upload_and_process(&self, owner: &str, filename: &str, content: &str) -> String {
        let task_id = self.upload(owner, filename, content).await;
        let job = self.next_job().await;
        assert_eq!(job.task_id, task_id);
        let outcome = self.processor.process(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        self.queue.ack(&job.handle, "test-worker").await.unwrap();
        task_id
    }
}
