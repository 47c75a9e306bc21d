//! Durable storage for queue tasks: `tasks/<task_id>/task.json` holds the
//! envelope, `request.json` the payload, both written atomically.

use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::app::model::{Task, TaskStatus};
use crate::model::GenerationRequest;
use crate::store::{read_json, write_json_atomic};

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &Task, request: &GenerationRequest) -> anyhow::Result<()>;
    async fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>>;
    async fn get_request(&self, task_id: &str) -> anyhow::Result<Option<GenerationRequest>>;
    async fn put(&self, task: &Task) -> anyhow::Result<()>;
    /// Queued tasks whose `next_run_at` has passed, earliest first.
    async fn list_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>>;
    /// Claim an idempotency key. Returns false when the key was already
    /// claimed by an earlier enqueue.
    async fn claim_idempotency_key(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct LocalFsTaskStore {
    base_dir: PathBuf,
}

impl LocalFsTaskStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    fn task_json_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("task.json")
    }

    fn request_json_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("request.json")
    }

    fn idempotency_path(&self, key: &str) -> PathBuf {
        self.base_dir.join("idempotency").join(sanitize_key(key))
    }
}

#[async_trait]
impl TaskStore for LocalFsTaskStore {
    async fn create(&self, task: &Task, request: &GenerationRequest) -> anyhow::Result<()> {
        fs::create_dir_all(self.task_dir(&task.task_id))
            .await
            .with_context(|| {
                format!("create task dir: {}", self.task_dir(&task.task_id).display())
            })?;
        write_json_atomic(&self.task_json_path(&task.task_id), task)
            .await
            .context("write task.json")?;
        write_json_atomic(&self.request_json_path(&task.task_id), request)
            .await
            .context("write request.json")?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        let path = self.task_json_path(task_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn get_request(&self, task_id: &str) -> anyhow::Result<Option<GenerationRequest>> {
        let path = self.request_json_path(task_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, task: &Task) -> anyhow::Result<()> {
        write_json_atomic(&self.task_json_path(&task.task_id), task)
            .await
            .context("write task.json")
    }

    async fn list_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>> {
        let dir = self.tasks_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read tasks dir: {}", dir.display()));
            }
        };

        let mut due = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("list tasks dir: {}", dir.display()))?
        {
            let task_id = entry.file_name().to_string_lossy().to_string();
            let Some(task) = self.get(&task_id).await? else {
                continue;
            };
            if task.status == TaskStatus::Queued && task.next_run_at <= now {
                due.push(task);
            }
        }

        due.sort_by_key(|task| task.next_run_at);
        Ok(due)
    }

    async fn claim_idempotency_key(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.idempotency_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create idempotency dir: {}", parent.display()))?;

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("claim idempotency key: {}", path.display()))
            }
        }
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
