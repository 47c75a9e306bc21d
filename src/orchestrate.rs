//! Per-book orchestration.
//!
//! One `Orchestrator::generate_book` call drives a dequeued task through
//! EXPANDING → GENERATING → {ASSEMBLING → COMPLETED} | FAILED. Page outcomes
//! are independent: a page that exhausts its retry budget is recorded as
//! failed without aborting its siblings, and only infrastructure errors
//! (store I/O, task join) propagate as `Err` to the queue boundary.
//!
//! Partial-failure policy: if any page ends failed the book is marked
//! `falha_geracao` and nothing is assembled. Completed assets stay on disk.

use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::GenerationError;
use crate::materialize::Materialize;
use crate::model::{
    BookStatus, GenerationRequest, NarrativeMode, Page, PageKind, PageStatus, expand_structure,
};
use crate::prompt;
use crate::provider::{ImageProvider, TextProvider};
use crate::store::BookStore;

#[derive(Clone)]
pub struct Orchestrator {
    book_store: Arc<dyn BookStore>,
    image_provider: Arc<dyn ImageProvider>,
    text_provider: Arc<dyn TextProvider>,
    materializer: Arc<dyn Materialize>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(
        book_store: Arc<dyn BookStore>,
        image_provider: Arc<dyn ImageProvider>,
        text_provider: Arc<dyn TextProvider>,
        materializer: Arc<dyn Materialize>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            book_store,
            image_provider,
            text_provider,
            materializer,
            config,
        }
    }

    /// Run the full pipeline for one generation task. Business failures end
    /// up in the book/page records; `Err` is reserved for infrastructure
    /// failures that the queue should retry.
    pub async fn generate_book(&self, request: &GenerationRequest) -> anyhow::Result<()> {
        let book_id = request.book_id.as_str();

        let mut pages = self
            .book_store
            .list_pages(book_id)
            .await
            .context("list pages")?;
        if pages.is_empty() {
            pages = expand_structure(book_id, &request.structure);
            for page in &pages {
                self.book_store
                    .put_page(page)
                    .await
                    .context("persist expanded page")?;
            }
            tracing::info!(book_id, pages = pages.len(), "expanded structure");
        } else {
            tracing::info!(
                book_id,
                pages = pages.len(),
                "pages already expanded; resuming non-terminal pages"
            );
        }

        match request.narrative {
            NarrativeMode::SingleTheme => {
                self.assign_scenes_single_theme(request, &mut pages).await?;
            }
            NarrativeMode::Interleaved => {
                self.run_interleaved_narrative(request, &mut pages).await?;
            }
        }

        let semaphore = Arc::new(Semaphore::new(
            self.config.generation.page_concurrency.max(1),
        ));
        let request = Arc::new(request.clone());
        let mut join_set = JoinSet::new();

        for page in pages {
            if !page.kind.bears_image() || page.status.is_terminal() {
                continue;
            }
            let this = self.clone();
            let request = Arc::clone(&request);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("page semaphore is closed");
                this.run_image_page(&request, page).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            joined.context("join page task")??;
        }

        self.finalize(&request).await
    }

    /// Single-theme expansion: one storyline call yields a scene description
    /// per line, assigned in order to scene-less illustration and coloring
    /// pages. A terminal storyline failure fails exactly those pages.
    async fn assign_scenes_single_theme(
        &self,
        request: &GenerationRequest,
        pages: &mut [Page],
    ) -> anyhow::Result<()> {
        let needs_scene = |page: &Page| {
            matches!(page.kind, PageKind::Illustration | PageKind::ColoringPage)
                && page.scene_summary.is_none()
                && !page.status.is_terminal()
        };
        let scene_count = pages.iter().filter(|p| needs_scene(p)).count();
        if scene_count == 0 {
            return Ok(());
        }

        let mut context = request.context.clone();
        context.insert("SCENE_COUNT".to_string(), scene_count.to_string());
        let template = self.config.template("storyline")?;
        let instructions = prompt::construct(
            template,
            &[],
            &context,
            self.config.generation.max_prompt_chars,
        );

        let (attempts, outcome) = self
            .complete_text_with_retry(&instructions, &request.title)
            .await;
        match outcome {
            Ok(text) => {
                let scenes = text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>();
                if scenes.len() < scene_count {
                    tracing::warn!(
                        book_id = %request.book_id,
                        wanted = scene_count,
                        got = scenes.len(),
                        "storyline returned fewer scenes than pages"
                    );
                }

                let mut scenes = scenes.into_iter();
                for page in pages.iter_mut().filter(|p| needs_scene(p)) {
                    let Some(scene) = scenes.next() else {
                        break;
                    };
                    page.scene_summary = Some(scene);
                    self.book_store
                        .put_page(page)
                        .await
                        .context("persist scene assignment")?;
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    book_id = %request.book_id,
                    attempts,
                    error = %err,
                    "storyline generation failed; failing scene-dependent pages"
                );
                for page in pages.iter_mut().filter(|p| needs_scene(p)) {
                    page.status = PageStatus::Failed;
                    page.attempt_count = attempts;
                    page.error_detail = Some(err.to_string());
                    self.book_store
                        .put_page(page)
                        .await
                        .context("persist storyline failure")?;
                }
                Ok(())
            }
        }
    }

    /// Interleaved narrative: pages walked in order; text pages extend the
    /// running story, illustration pages inherit the latest paragraph as
    /// their scene description. Sequential by construction.
    async fn run_interleaved_narrative(
        &self,
        request: &GenerationRequest,
        pages: &mut [Page],
    ) -> anyhow::Result<()> {
        let template = self.config.template("narrative_text")?.to_owned();
        let instructions = prompt::construct(
            &template,
            &[],
            &request.context,
            self.config.generation.max_prompt_chars,
        );

        let mut summary = String::new();
        let mut last_paragraph: Option<String> = None;

        for page in pages.iter_mut() {
            match page.kind {
                PageKind::Text => {
                    if page.status.is_terminal() {
                        if let Some(text) = &page.text_content {
                            append_paragraph(&mut summary, text);
                            last_paragraph = Some(text.clone());
                        }
                        continue;
                    }

                    page.status = PageStatus::Generating;
                    self.book_store
                        .put_page(page)
                        .await
                        .context("mark text page generating")?;

                    let input = if summary.is_empty() {
                        "Begin the story.".to_string()
                    } else {
                        format!("Story so far:\n{summary}")
                    };
                    let (attempts, outcome) =
                        self.complete_text_with_retry(&instructions, &input).await;

                    page.attempt_count = attempts;
                    page.prompt = Some(instructions.clone());
                    match outcome {
                        Ok(text) => {
                            let text = text.trim().to_string();
                            append_paragraph(&mut summary, &text);
                            last_paragraph = Some(text.clone());
                            page.text_content = Some(text);
                            page.status = PageStatus::Completed;
                            page.error_detail = None;
                        }
                        Err(err) => {
                            tracing::warn!(
                                book_id = %request.book_id,
                                page_number = page.page_number,
                                attempts,
                                error = %err,
                                "text page generation failed"
                            );
                            page.status = PageStatus::Failed;
                            page.error_detail = Some(err.to_string());
                        }
                    }
                    self.book_store
                        .put_page(page)
                        .await
                        .context("persist text page outcome")?;
                }
                PageKind::Illustration => {
                    if page.scene_summary.is_none() && !page.status.is_terminal() {
                        if let Some(scene) = &last_paragraph {
                            page.scene_summary = Some(scene.clone());
                            self.book_store
                                .put_page(page)
                                .await
                                .context("persist scene inheritance")?;
                        }
                    }
                }
                PageKind::CoverFront
                | PageKind::CoverBack
                | PageKind::Intro
                | PageKind::ColoringPage => {}
            }
        }

        Ok(())
    }

    /// The per-page sub-pipeline: prompt → provider (retry-wrapped with the
    /// materializer inside the same budget) → terminal page record.
    async fn run_image_page(
        &self,
        request: &GenerationRequest,
        mut page: Page,
    ) -> anyhow::Result<()> {
        page.status = PageStatus::Generating;
        page.error_detail = None;
        self.book_store
            .put_page(&page)
            .await
            .context("mark page generating")?;

        let template_key = page
            .template_key
            .clone()
            .unwrap_or_else(|| page.kind.template_key().to_string());
        let template = self.config.template(&template_key)?;

        let mut context = request.context.clone();
        if let Some(scene) = &page.scene_summary {
            context.insert("SCENE".to_string(), scene.clone());
        }
        let prompt = prompt::construct(
            template,
            &request.asset_descriptions,
            &context,
            self.config.generation.max_prompt_chars,
        );
        page.prompt = Some(prompt.clone());

        let (attempts, outcome) = self
            .generate_and_materialize_with_retry(&prompt, &request.reference_image_url)
            .await;
        page.attempt_count = attempts;
        match outcome {
            Ok((asset_url, local_path)) => {
                tracing::info!(
                    book_id = %page.book_id,
                    page_number = page.page_number,
                    attempts,
                    asset = %local_path,
                    "page completed"
                );
                page.asset_url = Some(asset_url);
                page.local_asset_path = Some(local_path);
                page.status = PageStatus::Completed;
                page.error_detail = None;
            }
            Err(err) => {
                tracing::warn!(
                    book_id = %page.book_id,
                    page_number = page.page_number,
                    attempts,
                    error = %err,
                    "page failed terminally"
                );
                page.status = PageStatus::Failed;
                page.error_detail = Some(err.to_string());
            }
        }

        self.book_store
            .put_page(&page)
            .await
            .context("persist page outcome")
    }

    /// A materializer failure counts against the same budget as a provider
    /// failure; callers never distinguish the two when deciding to retry.
    async fn generate_and_materialize_with_retry(
        &self,
        prompt: &str,
        reference_image_url: &str,
    ) -> (u32, Result<(String, String), GenerationError>) {
        let max_attempts = self.config.generation.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self
                .image_provider
                .generate(prompt, Some(reference_image_url))
                .await
            {
                Ok(asset_url) => match self.materializer.materialize(&asset_url).await {
                    Ok(local_path) => return (attempt, Ok((asset_url, local_path))),
                    Err(err) => err,
                },
                Err(err) => err,
            };

            if attempt >= max_attempts || !err.is_retryable() {
                return (attempt, Err(err));
            }
            tracing::warn!(
                attempt,
                max_attempts,
                error = %err,
                "generation attempt failed; retrying"
            );
            tokio::time::sleep(self.config.generation.retry_delay()).await;
        }
    }

    async fn complete_text_with_retry(
        &self,
        instructions: &str,
        input: &str,
    ) -> (u32, Result<String, GenerationError>) {
        let max_attempts = self.config.generation.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.text_provider.complete(instructions, input).await {
                Ok(text) => return (attempt, Ok(text)),
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "text attempt failed; retrying"
                    );
                    tokio::time::sleep(self.config.generation.retry_delay()).await;
                }
                Err(err) => return (attempt, Err(err)),
            }
        }
    }

    /// Decision point and assembly. Runs only once every page is terminal.
    async fn finalize(&self, request: &GenerationRequest) -> anyhow::Result<()> {
        let mut book = self
            .book_store
            .get_book(&request.book_id)
            .await
            .context("load book")?
            .ok_or_else(|| anyhow::anyhow!("book not found: {}", request.book_id))?;

        let pages = self
            .book_store
            .list_pages(&request.book_id)
            .await
            .context("list pages")?;
        let total = pages.len();
        let failed = pages
            .iter()
            .filter(|p| p.status == PageStatus::Failed)
            .count();
        let stuck = pages.iter().filter(|p| !p.status.is_terminal()).count();

        if failed > 0 || stuck > 0 {
            tracing::warn!(
                book_id = %book.book_id,
                total,
                failed,
                stuck,
                "book has failed pages; skipping assembly"
            );
            book.status = BookStatus::Failed;
            book.error_detail = Some(format!("{} of {total} pages failed", failed + stuck));
            book.updated_at = Utc::now();
            return self.book_store.put_book(&book).await.context("save book");
        }

        tracing::info!(book_id = %book.book_id, pages = total, "assembling document");
        let data_dir = self.config.data_dir.clone();
        let book_for_assembly = book.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            crate::assemble::assemble(&book_for_assembly, &pages, &data_dir)
        })
        .await
        .context("join assembly task")?;

        match outcome {
            Ok(artifact_path) => {
                tracing::info!(book_id = %book.book_id, artifact = %artifact_path, "book completed");
                book.status = BookStatus::Completed;
                book.artifact_path = Some(artifact_path);
                book.error_detail = None;
            }
            Err(err) => {
                tracing::error!(book_id = %book.book_id, error = %err, "assembly failed");
                book.status = BookStatus::Failed;
                book.error_detail = Some(err.to_string());
            }
        }
        book.updated_at = Utc::now();
        self.book_store.put_book(&book).await.context("save book")
    }
}

fn append_paragraph(summary: &mut String, paragraph: &str) {
    if !summary.is_empty() {
        summary.push('\n');
    }
    summary.push_str(paragraph);
}
