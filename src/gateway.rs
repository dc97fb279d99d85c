use std::sync::Arc;

use crate::db::Database;
use crate::error::GatewayError;
use crate::events::{AuditSink, TaskEvent, CATEGORY_UPLOADS};
use crate::models::{Task, TaskStatus};
use crate::queue::JobQueue;

/// Creates task records and hands them to the queue.
#[derive(Clone)]
pub struct TaskGateway {
    db: Database,
    queue: Arc<dyn JobQueue>,
    audit: Arc<dyn AuditSink>,
}

impl TaskGateway {
    pub fn new(db: Database, queue: Arc<dyn JobQueue>, audit: Arc<dyn AuditSink>) -> Self {
        TaskGateway { db, queue, audit }
    }

    /// The record is committed as `queued` before the job is enqueued, so a
    /// worker can never dequeue a job whose record does not exist yet.
    pub async fn submit(
        &self,
        owner_id: &str,
        filename: &str,
        file_size: u64,
        input_ref: &str,
    ) -> Result<String, GatewayError> {
        if owner_id.trim().is_empty() {
            return Err(GatewayError::InvalidInput("owner id is required".to_string()));
        }
        if filename.trim().is_empty() {
            return Err(GatewayError::InvalidInput("No filename provided".to_string()));
        }
        if input_ref.trim().is_empty() {
            return Err(GatewayError::InvalidInput("input reference is required".to_string()));
        }

        let task = Task::new_queued(owner_id, filename, file_size, input_ref);
        self.db.insert_task(&task)?;

        let handle = match self.queue.enqueue(&task.id, input_ref).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(task_id = %task.id, "task recorded but could not be queued: {}", e);
                return Err(e.into());
            }
        };
        self.db.set_job_id(&task.id, handle.as_str())?;

        tracing::info!(task_id = %task.id, job = %handle, owner = owner_id, "task queued");

        self.audit.record(
            CATEGORY_UPLOADS,
            TaskEvent::new(&task.id, TaskStatus::Queued)
                .owner(owner_id)
                .detail(serde_json::json!({
                    "filename": filename,
                    "file_size": file_size,
                    "job_id": handle.as_str(),
                })),
        );

        Ok(task.id)
    }
}
