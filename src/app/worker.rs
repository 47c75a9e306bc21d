//! The queue consumer: claims due tasks, hands them to the executor, applies
//! whole-task retry with exponential backoff, and parks exhausted tasks as
//! dead while failing their book.

use std::sync::Arc;

use anyhow::Context as _;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Semaphore;

use crate::app::model::{Task, TaskStatus};
use crate::app::runner::TaskExecutor;
use crate::app::task_store::TaskStore;
use crate::config::QueueConfig;

#[derive(Clone)]
pub struct Worker {
    task_store: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        config: QueueConfig,
    ) -> Self {
        let permits = config.worker_concurrency.max(1);
        Self {
            task_store,
            executor,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Consume tasks until cancelled (ctrl-c at the binary level). Task-level
    /// parallelism is bounded by `worker_concurrency`.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .expect("worker semaphore is closed");

            match self.claim_next().await? {
                Some(task) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = this.execute(task).await {
                            tracing::error!(?err, "task bookkeeping failed");
                        }
                    });
                }
                None => {
                    drop(permit);
                    tokio::time::sleep(self.config.tick()).await;
                }
            }
        }
    }

    /// One scheduling step: claim and execute the earliest due task inline.
    /// Returns false when nothing was due. Lets tests (and cron-style
    /// drivers) advance the queue deterministically.
    pub async fn process_next(&self) -> anyhow::Result<bool> {
        match self.claim_next().await? {
            Some(task) => {
                self.execute(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim_next(&self) -> anyhow::Result<Option<Task>> {
        let due = self
            .task_store
            .list_due(Utc::now())
            .await
            .context("list due tasks")?;
        let Some(mut task) = due.into_iter().next() else {
            return Ok(None);
        };

        task.status = TaskStatus::Running;
        task.attempt += 1;
        task.started_at = Some(Utc::now());
        self.task_store.put(&task).await.context("claim task")?;
        Ok(Some(task))
    }

    async fn execute(&self, mut task: Task) -> anyhow::Result<()> {
        let outcome = self.executor.run_task(&task).await;
        match outcome {
            Ok(()) => {
                tracing::info!(
                    task_id = %task.task_id,
                    book_id = %task.book_id,
                    attempt = task.attempt,
                    "task succeeded"
                );
                task.status = TaskStatus::Done;
                task.finished_at = Some(Utc::now());
                task.error_detail = None;
                self.task_store.put(&task).await.context("save task")
            }
            Err(err) if task.attempt >= self.config.max_attempts => {
                tracing::error!(
                    task_id = %task.task_id,
                    book_id = %task.book_id,
                    attempt = task.attempt,
                    ?err,
                    "task exhausted retries; marking dead"
                );
                task.status = TaskStatus::Dead;
                task.finished_at = Some(Utc::now());
                task.error_detail = Some(format!("{err:#}"));
                self.task_store.put(&task).await.context("save task")?;

                // The book must not stay stuck in `gerando`.
                self.executor
                    .mark_book_failed(&task.book_id, &format!("generation task died: {err:#}"))
                    .await
                    .context("mark book failed")
            }
            Err(err) => {
                let backoff = backoff_delay(self.config.backoff_base(), task.attempt);
                tracing::warn!(
                    task_id = %task.task_id,
                    book_id = %task.book_id,
                    attempt = task.attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    ?err,
                    "task failed; scheduling retry"
                );
                task.status = TaskStatus::Queued;
                task.next_run_at = Utc::now()
                    + ChronoDuration::milliseconds(backoff.as_millis() as i64);
                task.error_detail = Some(format!("{err:#}"));
                self.task_store.put(&task).await.context("save task")
            }
        }
    }
}

/// base * 2^(attempt-1): attempts land at base, 2x base, 4x base, ...
fn backoff_delay(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::task_store::LocalFsTaskStore;
    use crate::model::{GenerationRequest, NarrativeMode, PageKind, PageSpec, PromptContext};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedExecutor {
        /// Err results to burn through before succeeding.
        failures: Mutex<u32>,
        failed_books: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn run_task(&self, _task: &Task) -> anyhow::Result<()> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("injected infra failure");
            }
            Ok(())
        }

        async fn mark_book_failed(&self, book_id: &str, _message: &str) -> anyhow::Result<()> {
            self.failed_books.lock().unwrap().push(book_id.to_string());
            Ok(())
        }
    }

    fn request(book_id: &str) -> GenerationRequest {
        GenerationRequest {
            book_id: book_id.to_string(),
            title: "Zoo Day".to_string(),
            structure: vec![PageSpec {
                kind: PageKind::Illustration,
                template_key: None,
                repeats: 1,
                scene_summary: None,
            }],
            context: PromptContext::new(),
            reference_image_url: "https://example.com/jack.png".to_string(),
            asset_descriptions: Vec::new(),
            narrative: NarrativeMode::SingleTheme,
            print_format: None,
            idempotency_key: None,
        }
    }

    fn fast_queue_config() -> QueueConfig {
        QueueConfig {
            worker_concurrency: 1,
            max_attempts: 3,
            backoff_base_ms: 1,
            tick_ms: 1,
            task_deadline_ms: 60_000,
        }
    }

    async fn drain(worker: &Worker) -> anyhow::Result<()> {
        // Backoffs are 1-2ms in tests; poll until the queue goes quiet.
        for _ in 0..200 {
            if !worker.process_next().await? {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn successful_task_is_marked_done() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(LocalFsTaskStore::new(dir.path()));
        let executor = Arc::new(ScriptedExecutor {
            failures: Mutex::new(0),
            failed_books: Mutex::new(Vec::new()),
        });
        let worker = Worker::new(store.clone(), executor, fast_queue_config());

        let task = Task::new("book-ok");
        store.create(&task, &request("book-ok")).await?;

        assert!(worker.process_next().await?);
        let task = store.get(&task.task_id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempt, 1);
        assert!(task.finished_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn transient_failure_retries_with_backoff_then_succeeds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(LocalFsTaskStore::new(dir.path()));
        let executor = Arc::new(ScriptedExecutor {
            failures: Mutex::new(2),
            failed_books: Mutex::new(Vec::new()),
        });
        let worker = Worker::new(store.clone(), executor.clone(), fast_queue_config());

        let task = Task::new("book-flaky");
        store.create(&task, &request("book-flaky")).await?;

        drain(&worker).await?;

        let task = store.get(&task.task_id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.attempt, 3);
        assert!(executor.failed_books.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_task_goes_dead_and_book_is_failed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(LocalFsTaskStore::new(dir.path()));
        let executor = Arc::new(ScriptedExecutor {
            failures: Mutex::new(99),
            failed_books: Mutex::new(Vec::new()),
        });
        let worker = Worker::new(store.clone(), executor.clone(), fast_queue_config());

        let task = Task::new("book-doomed");
        store.create(&task, &request("book-doomed")).await?;

        drain(&worker).await?;

        // Dead task is retained for inspection, not deleted.
        let task = store.get(&task.task_id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
        assert_eq!(task.attempt, 3);
        assert!(task.error_detail.as_deref().unwrap().contains("injected"));
        assert_eq!(
            executor.failed_books.lock().unwrap().as_slice(),
            ["book-doomed"]
        );
        Ok(())
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));
    }
}
