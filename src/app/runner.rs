//! The outer error boundary around one task execution.
//!
//! Business failures (failed pages, failed assembly) are absorbed by the
//! orchestrator into book/page records and look like success to the queue.
//! Whatever escapes here is an infrastructure failure and is retried by the
//! worker with backoff; when the budget is gone the worker calls
//! `mark_book_failed` so a book is never left in `gerando` forever.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;

use crate::app::model::Task;
use crate::app::task_store::TaskStore;
use crate::config::Config;
use crate::model::BookStatus;
use crate::orchestrate::Orchestrator;
use crate::store::BookStore;

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run_task(&self, task: &Task) -> anyhow::Result<()>;
    async fn mark_book_failed(&self, book_id: &str, message: &str) -> anyhow::Result<()>;
}

pub struct TaskRunner {
    task_store: Arc<dyn TaskStore>,
    book_store: Arc<dyn BookStore>,
    orchestrator: Orchestrator,
    config: Arc<Config>,
}

impl TaskRunner {
    pub fn new(
        task_store: Arc<dyn TaskStore>,
        book_store: Arc<dyn BookStore>,
        orchestrator: Orchestrator,
        config: Arc<Config>,
    ) -> Self {
        Self {
            task_store,
            book_store,
            orchestrator,
            config,
        }
    }

    async fn mark_book_generating(&self, book_id: &str) -> anyhow::Result<()> {
        let mut book = self
            .book_store
            .get_book(book_id)
            .await
            .context("load book")?
            .ok_or_else(|| anyhow::anyhow!("book not found: {book_id}"))?;
        book.status = BookStatus::Generating;
        book.updated_at = Utc::now();
        self.book_store.put_book(&book).await.context("save book")
    }
}

#[async_trait]
impl TaskExecutor for TaskRunner {
    async fn run_task(&self, task: &Task) -> anyhow::Result<()> {
        let request = self
            .task_store
            .get_request(&task.task_id)
            .await
            .context("load request")?
            .ok_or_else(|| anyhow::anyhow!("request not found: {}", task.task_id))?;

        self.mark_book_generating(&request.book_id)
            .await
            .context("mark book generating")?;

        let deadline = self.config.queue.task_deadline();
        match tokio::time::timeout(deadline, self.orchestrator.generate_book(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => anyhow::bail!(
                "task {} exceeded its deadline ({deadline:?})",
                task.task_id
            ),
        }
    }

    async fn mark_book_failed(&self, book_id: &str, message: &str) -> anyhow::Result<()> {
        let Some(mut book) = self
            .book_store
            .get_book(book_id)
            .await
            .context("load book")?
        else {
            return Ok(());
        };
        book.status = BookStatus::Failed;
        book.error_detail = Some(message.to_string());
        book.updated_at = Utc::now();
        self.book_store.put_book(&book).await.context("save book")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::model::{Task, TaskStatus};
    use crate::app::task_store::LocalFsTaskStore;
    use crate::app::worker::Worker;
    use crate::error::GenerationError;
    use crate::materialize::Materialize;
    use crate::model::{
        Book, GenerationRequest, NarrativeMode, PageKind, PageSpec, PageStatus, PromptContext,
    };
    use crate::provider::{ImageProvider, TextProvider};
    use crate::store::LocalFsBookStore;
    use std::sync::Arc;
    use std::time::Duration;

    /// Never finishes within any reasonable deadline.
    struct StalledImageProvider;

    #[async_trait]
    impl ImageProvider for StalledImageProvider {
        async fn generate(
            &self,
            _prompt: &str,
            _reference_image_url: Option<&str>,
        ) -> Result<String, GenerationError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok("https://cdn.example.com/never.png".to_string())
        }
    }

    struct UnusedTextProvider;

    #[async_trait]
    impl TextProvider for UnusedTextProvider {
        async fn complete(&self, _: &str, _: &str) -> Result<String, GenerationError> {
            Err(GenerationError::Provider("not expected in this test".into()))
        }
    }

    struct UnusedMaterializer;

    #[async_trait]
    impl Materialize for UnusedMaterializer {
        async fn materialize(&self, _: &str) -> Result<String, GenerationError> {
            Err(GenerationError::Persistence("not expected in this test".into()))
        }
    }

    fn stalled_request(book_id: &str) -> GenerationRequest {
        GenerationRequest {
            book_id: book_id.to_string(),
            title: "Zoo Day".to_string(),
            structure: vec![PageSpec {
                kind: PageKind::Illustration,
                template_key: None,
                repeats: 1,
                scene_summary: Some("Jack at the gate".to_string()),
            }],
            context: PromptContext::new(),
            reference_image_url: "https://example.com/jack.png".to_string(),
            asset_descriptions: Vec::new(),
            narrative: NarrativeMode::SingleTheme,
            print_format: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn expired_deadline_requeues_then_kills_task_and_fails_book() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.queue.max_attempts = 2;
        config.queue.backoff_base_ms = 1;
        config.queue.tick_ms = 1;
        config.queue.task_deadline_ms = 50;
        config.generation.retry_delay_ms = 1;
        let config = Arc::new(config);

        let book_store = Arc::new(LocalFsBookStore::new(dir.path()));
        let task_store = Arc::new(LocalFsTaskStore::new(dir.path()));
        let orchestrator = Orchestrator::new(
            book_store.clone(),
            Arc::new(StalledImageProvider),
            Arc::new(UnusedTextProvider),
            Arc::new(UnusedMaterializer),
            Arc::clone(&config),
        );
        let runner = Arc::new(TaskRunner::new(
            task_store.clone(),
            book_store.clone(),
            orchestrator,
            Arc::clone(&config),
        ));
        let worker = Worker::new(task_store.clone(), runner, config.queue.clone());

        let request = stalled_request("book-stalled");
        let now = Utc::now();
        book_store
            .put_book(&Book {
                book_id: request.book_id.clone(),
                title: request.title.clone(),
                status: BookStatus::Queued,
                structure: request.structure.clone(),
                reference_image_url: request.reference_image_url.clone(),
                print_format: None,
                artifact_path: None,
                error_detail: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        let task = Task::new(request.book_id.clone());
        task_store.create(&task, &request).await?;

        // First attempt: deadline fires mid-fan-out. The page stays
        // non-terminal on disk and the task goes back to the queue.
        assert!(worker.process_next().await?);
        let claimed = task_store.get(&task.task_id).await?.unwrap();
        assert_eq!(claimed.status, TaskStatus::Queued);
        assert_eq!(claimed.attempt, 1);
        assert!(
            claimed
                .error_detail
                .as_deref()
                .unwrap()
                .contains("deadline")
        );
        let pages = book_store.list_pages("book-stalled").await?;
        assert_eq!(pages.len(), 1);
        assert!(!pages[0].status.is_terminal());

        // Second attempt resumes the non-terminal page, expires again, and
        // exhausts the queue budget.
        for _ in 0..200 {
            if worker.process_next().await? {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let dead = task_store.get(&task.task_id).await?.unwrap();
        assert_eq!(dead.status, TaskStatus::Dead);
        assert_eq!(dead.attempt, 2);

        let book = book_store.get_book("book-stalled").await?.unwrap();
        assert_eq!(book.status, BookStatus::Failed);
        assert!(
            book.error_detail
                .as_deref()
                .unwrap()
                .contains("deadline")
        );

        // Resume path persisted a Generating page, never a terminal one.
        let pages = book_store.list_pages("book-stalled").await?;
        assert_eq!(pages[0].status, PageStatus::Generating);
        Ok(())
    }
}
