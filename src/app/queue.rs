//! Queue admission: validation, idempotency, task persistence.
//!
//! Without an idempotency key, enqueuing the same book twice concurrently is
//! accepted and the two tasks may race; the key is the only guard.

use std::sync::Arc;

use anyhow::Context as _;

use crate::app::model::Task;
use crate::app::task_store::TaskStore;
use crate::model::GenerationRequest;

#[derive(Clone)]
pub struct TaskQueue {
    task_store: Arc<dyn TaskStore>,
}

impl TaskQueue {
    pub fn new(task_store: Arc<dyn TaskStore>) -> Self {
        Self { task_store }
    }

    /// Accept a generation request into the queue and return its task.
    ///
    /// Validation failures surface synchronously to the caller; an invalid
    /// request never reaches the task store.
    pub async fn enqueue(&self, request: &GenerationRequest) -> anyhow::Result<Task> {
        request.validate()?;

        if let Some(key) = &request.idempotency_key {
            let claimed = self
                .task_store
                .claim_idempotency_key(key)
                .await
                .context("claim idempotency key")?;
            if !claimed {
                anyhow::bail!("duplicate enqueue rejected (idempotency key: {key})");
            }
        }

        let task = Task::new(request.book_id.clone());
        self.task_store
            .create(&task, request)
            .await
            .context("persist task")?;
        tracing::info!(
            task_id = %task.task_id,
            book_id = %task.book_id,
            "generation task enqueued"
        );
        Ok(task)
    }
}
