use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::Database;
use crate::error::QueryError;
use crate::models::{truncate_chars, Task, TaskStatus};
use crate::similarity::{cosine_similarity, interpret_score, top_k_similar};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_TOP_K: usize = 5;
pub const MAX_TOP_K: usize = 20;

/// Preview length shown next to similarity hits.
const LISTING_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRef {
    pub task_id: String,
    pub filename: String,
    pub content_preview: Option<String>,
}

impl TaskRef {
    fn from_task(task: &Task) -> Self {
        TaskRef {
            task_id: task.id.clone(),
            filename: task.filename.clone(),
            content_preview: listing_preview(task),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarDocument {
    pub task_id: String,
    pub filename: String,
    pub file_size: u64,
    pub similarity_score: f32,
    pub content_preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SimilarityReport {
    pub reference_task: TaskRef,
    pub similar_documents: Vec<SimilarDocument>,
    pub total_found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Comparison {
    pub task_1: TaskRef,
    pub task_2: TaskRef,
    pub similarity_score: f32,
    pub interpretation: &'static str,
}

/// Owner-scoped read path over the task store.
#[derive(Clone)]
pub struct QueryService {
    db: Database,
}

impl QueryService {
    pub fn new(db: Database) -> Self {
        QueryService { db }
    }

    pub fn get_task(&self, task_id: &str, owner_id: &str) -> Result<Task, QueryError> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| QueryError::NotFound(task_id.to_string()))?;
        if task.owner_id != owner_id {
            return Err(QueryError::Forbidden(task_id.to_string()));
        }
        Ok(task)
    }

    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn list_tasks(&self, owner_id: &str, limit: usize, offset: usize) -> Result<TaskPage, QueryError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let (tasks, total) = self.db.list_tasks(owner_id, limit, offset)?;
        Ok(TaskPage {
            tasks,
            total,
            limit,
            offset,
        })
    }

    /// Ranks the owner's other embedded tasks against the reference task.
    /// `k` is clamped to `1..=MAX_TOP_K`.
    pub fn find_similar(&self, task_id: &str, owner_id: &str, k: usize) -> Result<SimilarityReport, QueryError> {
        let reference = self.get_task(task_id, owner_id)?;
        let query = match (reference.status(), reference.embedding()) {
            (TaskStatus::Completed, Some(embedding)) => embedding,
            _ => {
                return Err(QueryError::MissingEmbedding(
                    "Reference task does not have embedding. File may not be processed yet."
                        .to_string(),
                ))
            }
        };

        let candidates = self.db.embedded_tasks(owner_id, &reference.id)?;
        if candidates.is_empty() {
            return Ok(SimilarityReport {
                reference_task: TaskRef::from_task(&reference),
                similar_documents: Vec::new(),
                total_found: 0,
                message: Some("No other documents with embeddings found".to_string()),
            });
        }

        let ranked = top_k_similar(
            query,
            candidates
                .iter()
                .filter_map(|t| t.embedding().map(|e| (t.id.as_str(), e))),
            k.clamp(1, MAX_TOP_K),
        )?;

        let by_id: HashMap<&str, &Task> = candidates.iter().map(|t| (t.id.as_str(), t)).collect();
        let similar_documents: Vec<SimilarDocument> = ranked
            .into_iter()
            .filter_map(|(id, score)| {
                by_id.get(id.as_str()).map(|task| SimilarDocument {
                    task_id: task.id.clone(),
                    filename: task.filename.clone(),
                    file_size: task.file_size,
                    similarity_score: score,
                    content_preview: listing_preview(task),
                    created_at: task.created_at,
                })
            })
            .collect();

        Ok(SimilarityReport {
            reference_task: TaskRef::from_task(&reference),
            total_found: similar_documents.len(),
            similar_documents,
            message: None,
        })
    }

    pub fn compare(&self, task_id_a: &str, task_id_b: &str, owner_id: &str) -> Result<Comparison, QueryError> {
        let a = self.get_task(task_id_a, owner_id)?;
        let b = self.get_task(task_id_b, owner_id)?;

        let (Some(ea), Some(eb)) = (a.embedding(), b.embedding()) else {
            return Err(QueryError::MissingEmbedding(
                "One or both tasks do not have embeddings".to_string(),
            ));
        };

        let score = cosine_similarity(ea, eb)?;
        Ok(Comparison {
            task_1: TaskRef::from_task(&a),
            task_2: TaskRef::from_task(&b),
            similarity_score: score,
            interpretation: interpret_score(score),
        })
    }
}

fn listing_preview(task: &Task) -> Option<String> {
    task.result()
        .and_then(|r| r.content_preview.as_deref())
        .map(|p| truncate_chars(p, LISTING_PREVIEW_CHARS).to_string())
}
