//! Durable job queue.
//!
//! Jobs carry a task id and an input reference from the gateway to the
//! workers. Delivery is at-least-once: `dequeue` leases a job to one worker,
//! and a lease that expires without `ack`/`fail` (the worker crashed) is put
//! back by `reclaim_expired` and delivered again. A live worker keeps its
//! lease with `extend_lease`; only the current holder can settle a job.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::QueueError;

type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(value: impl Into<String>) -> Self {
        JobHandle(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Failed,
    Unknown,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "finished" => Self::Finished,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// A delivered job. `attempt` is 1 on first delivery and grows with every
/// redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub handle: JobHandle,
    pub task_id: String,
    pub input_ref: String,
    pub attempt: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, task_id: &str, input_ref: &str) -> Result<JobHandle>;

    /// Waits until a job is available and leases it to `worker_id`.
    async fn dequeue(&self, worker_id: &str) -> Result<Job>;

    /// Leases a job if one is ready, without waiting.
    async fn try_dequeue(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Marks a delivered job done; it will not be delivered again.
    /// `QueueError::LeaseLost` if `worker_id` no longer holds the lease.
    async fn ack(&self, handle: &JobHandle, worker_id: &str) -> Result<()>;

    /// Marks a delivered job failed; it will not be delivered again.
    async fn fail(&self, handle: &JobHandle, worker_id: &str, reason: &str) -> Result<()>;

    /// Pushes the lease deadline out by one lease period. `false` means the
    /// lease was lost and the job may be running elsewhere.
    async fn extend_lease(&self, handle: &JobHandle, worker_id: &str) -> Result<bool>;

    /// Length of one lease.
    fn lease(&self) -> Duration;

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Returns expired leases to the pending state. Returns how many.
    async fn reclaim_expired(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// SQLite-backed queue. Survives restarts; safe to share between worker
/// tasks and between processes opening the same file.
#[derive(Clone)]
pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
    config: QueueConfig,
}

impl SqliteJobQueue {
    pub fn new(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, config)
    }

    pub fn in_memory(config: QueueConfig) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, config)
    }

    fn init(conn: Connection, config: QueueConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                handle TEXT NOT NULL UNIQUE,
                task_id TEXT NOT NULL,
                input_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                leased_until INTEGER,
                last_error TEXT,
                enqueued_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, seq);
            "#,
        )?;

        Ok(SqliteJobQueue {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
            config,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| QueueError::Poisoned)
    }

    fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now().timestamp_millis();
        let leased_until = now.saturating_add(self.config.lease.as_millis() as i64);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = tx
            .query_row(
                "SELECT handle, task_id, input_ref, attempts FROM jobs
                 WHERE status = 'pending' ORDER BY seq ASC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((handle, task_id, input_ref, attempts)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, worker_id = ?1, leased_until = ?2
             WHERE handle = ?3 AND status = 'pending'",
            params![worker_id, leased_until, handle],
        )?;
        tx.commit()?;

        tracing::debug!(job = %handle, task_id = %task_id, worker = worker_id, "job leased");

        Ok(Some(Job {
            handle: JobHandle(handle),
            task_id,
            input_ref,
            attempt: (attempts + 1) as u32,
        }))
    }

    fn settle(
        &self,
        handle: &JobHandle,
        worker_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE jobs SET status = ?1, last_error = ?2, worker_id = NULL, leased_until = NULL
             WHERE handle = ?3 AND worker_id = ?4 AND status = 'running'",
            params![status.as_str(), error, handle.as_str(), worker_id],
        )?;
        if updated > 0 {
            return Ok(());
        }

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM jobs WHERE handle = ?1",
                params![handle.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(QueueError::LeaseLost(handle.to_string())),
            None => Err(QueueError::NotFound(handle.to_string())),
        }
    }

    /// Number of jobs waiting for a worker.
    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, task_id: &str, input_ref: &str) -> Result<JobHandle> {
        let handle = JobHandle(Uuid::new_v4().to_string());
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO jobs (handle, task_id, input_ref, status, enqueued_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![
                    handle.as_str(),
                    task_id,
                    input_ref,
                    Utc::now().timestamp_millis()
                ],
            )?;
        }
        self.notify.notify_one();
        tracing::debug!(job = %handle, task_id, "job enqueued");
        Ok(handle)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Job> {
        loop {
            if let Some(job) = self.claim(worker_id)? {
                return Ok(job);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn try_dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        self.claim(worker_id)
    }

    async fn ack(&self, handle: &JobHandle, worker_id: &str) -> Result<()> {
        self.settle(handle, worker_id, JobStatus::Finished, None)
    }

    async fn fail(&self, handle: &JobHandle, worker_id: &str, reason: &str) -> Result<()> {
        self.settle(handle, worker_id, JobStatus::Failed, Some(reason))
    }

    async fn extend_lease(&self, handle: &JobHandle, worker_id: &str) -> Result<bool> {
        let leased_until = Utc::now()
            .timestamp_millis()
            .saturating_add(self.config.lease.as_millis() as i64);
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE jobs SET leased_until = ?1
             WHERE handle = ?2 AND worker_id = ?3 AND status = 'running'",
            params![leased_until, handle.as_str(), worker_id],
        )?;
        Ok(updated > 0)
    }

    fn lease(&self) -> Duration {
        self.config.lease
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE handle = ?1",
                params![handle.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.map_or(JobStatus::Unknown, |s| JobStatus::parse(&s)))
    }

    async fn reclaim_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let reclaimed = {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE jobs SET status = 'pending', worker_id = NULL, leased_until = NULL,
                    last_error = 'lease expired'
                 WHERE status = 'running' AND (leased_until IS NULL OR leased_until <= ?1)",
                params![now],
            )?
        };

        if reclaimed > 0 {
            tracing::warn!(reclaimed, "returned expired job leases to the queue");
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }
}
