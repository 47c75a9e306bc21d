use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    /// Retry budget exhausted. Dead tasks are retained on disk for
    /// inspection, never silently dropped.
    Dead,
}

/// Queue envelope for one generation task. The payload itself (the
/// `GenerationRequest`) is persisted next to it by the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub book_id: String,
    pub status: TaskStatus,
    /// Whole-task delivery attempts, independent of per-page retries.
    pub attempt: u32,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl Task {
    pub fn new(book_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            book_id: book_id.into(),
            status: TaskStatus::Queued,
            attempt: 0,
            next_run_at: now,
            created_at: now,
            started_at: None,
            finished_at: None,
            error_detail: None,
        }
    }
}
