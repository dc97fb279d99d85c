use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::models::{
    truncate_chars, AnalysisMetrics, AnalysisResult, Task, TaskState, TaskStatus, MAX_ERROR_LEN,
};

type Result<T> = std::result::Result<T, StoreError>;

const TASK_COLUMNS: &str = "id, owner_id, filename, file_size, input_ref, job_id, status, \
     result, embedding, content_preview, error, created_at, started_at, completed_at";

/// Durable task table. Every write is a single-row statement; lifecycle
/// updates are guarded on the current status so a stale writer cannot move
/// a record backwards.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                input_ref TEXT NOT NULL,
                job_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                result TEXT,
                embedding TEXT,
                content_preview TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_owner_created ON tasks(owner_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category TEXT NOT NULL,
                task_id TEXT,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_events_task ON audit_events(task_id);
            "#,
        )?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        if task.status() != TaskStatus::Queued {
            return Err(StoreError::InvalidTransition {
                task_id: task.id.clone(),
                from: task.status(),
                to: TaskStatus::Queued,
            });
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (id, owner_id, filename, file_size, input_ref, job_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7)",
            params![
                task.id,
                task.owner_id,
                task.filename,
                task.file_size as i64,
                task.input_ref,
                task.job_id,
                format_ts(&task.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn set_job_id(&self, id: &str, job_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET job_id = ?1 WHERE id = ?2",
            params![job_id, id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let raw = conn
            .query_row(&sql, params![id], RawTask::from_row)
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    /// Newest first, with the owner's total task count.
    pub fn list_tasks(&self, owner_id: &str, limit: usize, offset: usize) -> Result<(Vec<Task>, u64)> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![owner_id, limit as i64, offset as i64],
            RawTask::from_row,
        )?;

        let mut tasks = Vec::new();
        for raw in rows {
            tasks.push(raw?.into_task()?);
        }

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;

        Ok((tasks, total as u64))
    }

    /// The owner's completed tasks that carry an embedding, oldest first.
    pub fn embedded_tasks(&self, owner_id: &str, exclude_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE owner_id = ?1 AND id != ?2 AND status = 'completed' AND embedding IS NOT NULL
             ORDER BY created_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id, exclude_id], RawTask::from_row)?;

        let mut tasks = Vec::new();
        for raw in rows {
            tasks.push(raw?.into_task()?);
        }
        Ok(tasks)
    }

    /// `queued -> processing`, or the re-run of an abandoned `processing`
    /// attempt. Returns the stamped start time.
    pub fn mark_task_processing(&self, id: &str) -> Result<DateTime<Utc>> {
        let started_at = Utc::now();
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = 'processing', started_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'processing')",
            params![format_ts(&started_at), id],
        )?;
        if updated == 0 {
            return Err(transition_error(&conn, id, TaskStatus::Processing));
        }
        Ok(started_at)
    }

    pub fn mark_task_completed(&self, id: &str, result: &AnalysisResult) -> Result<DateTime<Utc>> {
        let completed_at = Utc::now();
        let metrics = serde_json::to_string(&result.metrics)?;
        let embedding = result
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = 'completed', result = ?1, embedding = ?2,
                content_preview = ?3, error = NULL, completed_at = ?4
             WHERE id = ?5 AND status = 'processing'",
            params![
                metrics,
                embedding,
                result.content_preview,
                format_ts(&completed_at),
                id
            ],
        )?;
        if updated == 0 {
            return Err(transition_error(&conn, id, TaskStatus::Completed));
        }
        Ok(completed_at)
    }

    pub fn mark_task_failed(&self, id: &str, error: &str) -> Result<DateTime<Utc>> {
        let completed_at = Utc::now();
        let error = truncate_chars(error, MAX_ERROR_LEN);

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = 'failed', error = ?1, result = NULL, embedding = NULL,
                content_preview = NULL, completed_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            params![error, format_ts(&completed_at), id],
        )?;
        if updated == 0 {
            return Err(transition_error(&conn, id, TaskStatus::Failed));
        }
        Ok(completed_at)
    }

    pub fn insert_audit_event(
        &self,
        category: &str,
        task_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_events (category, task_id, payload, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![category, task_id, payload, format_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// `(category, payload)` pairs recorded for a task, in insertion order.
    pub fn audit_events_for_task(&self, task_id: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT category, payload FROM audit_events WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (category, payload) = row?;
            events.push((category, serde_json::from_str(&payload)?));
        }
        Ok(events)
    }
}

fn transition_error(conn: &Connection, id: &str, to: TaskStatus) -> StoreError {
    let current: rusqlite::Result<Option<String>> = conn
        .query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
        .optional();

    match current {
        Ok(Some(status)) => match TaskStatus::parse(&status) {
            Some(from) => StoreError::InvalidTransition {
                task_id: id.to_string(),
                from,
                to,
            },
            None => StoreError::Corrupt {
                task_id: id.to_string(),
                reason: format!("unknown status {status:?}"),
            },
        },
        Ok(None) => StoreError::NotFound(id.to_string()),
        Err(e) => StoreError::Sqlite(e),
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(task_id: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            task_id: task_id.to_string(),
            reason: format!("bad timestamp {value:?}: {e}"),
        })
}

/// Row as stored, before the status and payload columns are folded into a
/// `TaskState`.
struct RawTask {
    id: String,
    owner_id: String,
    filename: String,
    file_size: i64,
    input_ref: String,
    job_id: Option<String>,
    status: String,
    result: Option<String>,
    embedding: Option<String>,
    content_preview: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawTask {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            filename: row.get(2)?,
            file_size: row.get(3)?,
            input_ref: row.get(4)?,
            job_id: row.get(5)?,
            status: row.get(6)?,
            result: row.get(7)?,
            embedding: row.get(8)?,
            content_preview: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let corrupt = |reason: String| StoreError::Corrupt {
            task_id: self.id.clone(),
            reason,
        };

        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;

        let state = match status {
            TaskStatus::Queued => TaskState::Queued,
            TaskStatus::Processing => TaskState::Processing,
            TaskStatus::Completed => {
                let raw = self
                    .result
                    .as_deref()
                    .ok_or_else(|| corrupt("completed without result".to_string()))?;
                let metrics: AnalysisMetrics = serde_json::from_str(raw)?;
                let embedding = self
                    .embedding
                    .as_deref()
                    .map(serde_json::from_str::<Vec<f32>>)
                    .transpose()?;
                TaskState::Completed {
                    result: AnalysisResult {
                        metrics,
                        embedding,
                        content_preview: self.content_preview.clone(),
                    },
                }
            }
            TaskStatus::Failed => TaskState::Failed {
                error: self
                    .error
                    .clone()
                    .ok_or_else(|| corrupt("failed without error".to_string()))?,
            },
        };

        let started_at = self
            .started_at
            .as_deref()
            .map(|ts| parse_ts(&self.id, ts))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|ts| parse_ts(&self.id, ts))
            .transpose()?;
        let created_at = parse_ts(&self.id, &self.created_at)?;

        Ok(Task {
            id: self.id,
            owner_id: self.owner_id,
            filename: self.filename,
            file_size: self.file_size.max(0) as u64,
            input_ref: self.input_ref,
            job_id: self.job_id,
            state,
            created_at,
            started_at,
            completed_at,
        })
    }
}
