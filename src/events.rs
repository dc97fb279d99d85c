use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::Database;
use crate::models::TaskStatus;

pub const CATEGORY_UPLOADS: &str = "file_uploads";
pub const CATEGORY_PROCESSING: &str = "task_processing";

#[derive(Clone, Debug, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub owner_id: Option<String>,
    pub status: TaskStatus,
    pub detail: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        TaskEvent {
            task_id: task_id.into(),
            owner_id: None,
            status,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// What live subscribers receive.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub category: String,
    #[serde(flatten)]
    pub event: TaskEvent,
}

/// Fire-and-forget event sink. Implementations log their own failures and
/// never report them to the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, category: &str, event: TaskEvent);
}

/// Persists events to the `audit_events` table and fans them out to SSE
/// subscribers.
#[derive(Clone)]
pub struct EventLog {
    db: Database,
    tx: broadcast::Sender<AuditRecord>,
}

impl EventLog {
    pub fn new(db: Database, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventLog { db, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.tx.subscribe()
    }
}

impl AuditSink for EventLog {
    fn record(&self, category: &str, event: TaskEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                if let Err(e) = self
                    .db
                    .insert_audit_event(category, Some(&event.task_id), &payload)
                {
                    tracing::error!(task_id = %event.task_id, category, "failed to log event: {}", e);
                }
            }
            Err(e) => {
                tracing::error!(task_id = %event.task_id, category, "failed to encode event: {}", e);
            }
        }

        // No subscribers is not an error
        let _ = self.tx.send(AuditRecord {
            category: category.to_string(),
            event,
        });
    }
}
