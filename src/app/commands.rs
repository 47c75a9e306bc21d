//! Command entry points behind the CLI. Wiring only: load config, build the
//! stores and adapters, delegate to the queue/worker/stores.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;

use crate::app::queue::TaskQueue;
use crate::app::runner::TaskRunner;
use crate::app::task_store::LocalFsTaskStore;
use crate::app::worker::Worker;
use crate::cli::{EnqueueArgs, StatusArgs, WorkerArgs};
use crate::config::Config;
use crate::materialize::HttpMaterializer;
use crate::model::{Book, BookStatus, GenerationRequest};
use crate::orchestrate::Orchestrator;
use crate::provider::{image_provider_from_config, text_provider_from_config};
use crate::store::{BookStore, LocalFsBookStore};

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(Path::new(path)),
        None => Ok(Config::default()),
    }
}

pub async fn enqueue(args: EnqueueArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    let raw = tokio::fs::read_to_string(&args.request)
        .await
        .with_context(|| format!("read request: {}", args.request))?;
    let mut request: GenerationRequest = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse request: {}", args.request))?;
    if request.book_id.trim().is_empty() {
        request.book_id = uuid::Uuid::new_v4().to_string();
    }

    let book_store = LocalFsBookStore::new(&config.data_dir);
    let task_store = Arc::new(LocalFsTaskStore::new(&config.data_dir));
    let queue = TaskQueue::new(task_store);

    // A repeat enqueue for an existing book must not reset its record.
    let existing = book_store
        .get_book(&request.book_id)
        .await
        .context("load book")?;
    let mut book = match existing {
        Some(book) => book,
        None => {
            let now = Utc::now();
            let book = Book {
                book_id: request.book_id.clone(),
                title: request.title.clone(),
                status: BookStatus::Pending,
                structure: request.structure.clone(),
                reference_image_url: request.reference_image_url.clone(),
                print_format: request.print_format.clone(),
                artifact_path: None,
                error_detail: None,
                created_at: now,
                updated_at: now,
            };
            book_store.put_book(&book).await.context("create book")?;
            book
        }
    };

    let task = queue.enqueue(&request).await?;

    book.status = BookStatus::Queued;
    book.updated_at = Utc::now();
    book_store.put_book(&book).await.context("update book")?;

    println!("book_id: {}", book.book_id);
    println!("task_id: {}", task.task_id);
    Ok(())
}

pub async fn worker(args: WorkerArgs) -> anyhow::Result<()> {
    let config = Arc::new(load_config(args.config.as_deref())?);

    let book_store: Arc<dyn BookStore> = Arc::new(LocalFsBookStore::new(&config.data_dir));
    let task_store = Arc::new(LocalFsTaskStore::new(&config.data_dir));

    let image_provider = image_provider_from_config(&config.image_provider, &config.generation)
        .context("configure image provider")?;
    let text_provider =
        text_provider_from_config(&config.text_provider).context("configure text provider")?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .context("build http client")?;
    let materializer = Arc::new(HttpMaterializer::new(client, &config.data_dir));

    let orchestrator = Orchestrator::new(
        Arc::clone(&book_store),
        image_provider,
        text_provider,
        materializer,
        Arc::clone(&config),
    );
    let runner = Arc::new(TaskRunner::new(
        task_store.clone(),
        book_store,
        orchestrator,
        Arc::clone(&config),
    ));
    let worker = Worker::new(task_store, runner, config.queue.clone());

    tracing::info!(
        data_dir = %config.data_dir.display(),
        concurrency = config.queue.worker_concurrency,
        "worker started"
    );

    tokio::select! {
        outcome = worker.run() => outcome,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

pub async fn status(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let book_store = LocalFsBookStore::new(&config.data_dir);

    let book = book_store
        .get_book(&args.book_id)
        .await
        .context("load book")?
        .ok_or_else(|| anyhow::anyhow!("book not found: {}", args.book_id))?;
    let pages = book_store
        .list_pages(&args.book_id)
        .await
        .context("load pages")?;

    let report = serde_json::json!({
        "book": book,
        "pages": pages,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize status")?
    );
    Ok(())
}
