//! Durable records for books and pages.
//!
//! Each book lives under `books/<book_id>/` in the data dir: `book.json` plus
//! one `pages/<NNNN>.json` per page. Writes go through a tmp-file-then-rename
//! so readers never observe a half-written record.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::model::{Book, Page};

#[async_trait]
pub trait BookStore: Send + Sync {
    async fn get_book(&self, book_id: &str) -> anyhow::Result<Option<Book>>;
    async fn put_book(&self, book: &Book) -> anyhow::Result<()>;
    async fn put_page(&self, page: &Page) -> anyhow::Result<()>;
    /// All pages of a book in ascending page number order.
    async fn list_pages(&self, book_id: &str) -> anyhow::Result<Vec<Page>>;
}

#[derive(Debug, Clone)]
pub struct LocalFsBookStore {
    base_dir: PathBuf,
}

impl LocalFsBookStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn book_dir(&self, book_id: &str) -> PathBuf {
        self.base_dir.join("books").join(book_id)
    }

    fn book_json_path(&self, book_id: &str) -> PathBuf {
        self.book_dir(book_id).join("book.json")
    }

    fn pages_dir(&self, book_id: &str) -> PathBuf {
        self.book_dir(book_id).join("pages")
    }

    fn page_json_path(&self, book_id: &str, page_number: u32) -> PathBuf {
        self.pages_dir(book_id)
            .join(format!("{page_number:04}.json"))
    }
}

#[async_trait]
impl BookStore for LocalFsBookStore {
    async fn get_book(&self, book_id: &str) -> anyhow::Result<Option<Book>> {
        let path = self.book_json_path(book_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put_book(&self, book: &Book) -> anyhow::Result<()> {
        write_json_atomic(&self.book_json_path(&book.book_id), book)
            .await
            .context("write book.json")
    }

    async fn put_page(&self, page: &Page) -> anyhow::Result<()> {
        let path = self.page_json_path(&page.book_id, page.page_number);
        write_json_atomic(&path, page)
            .await
            .with_context(|| format!("write page {:04}", page.page_number))
    }

    async fn list_pages(&self, book_id: &str) -> anyhow::Result<Vec<Page>> {
        let dir = self.pages_dir(book_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read pages dir: {}", dir.display()));
            }
        };

        let mut pages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("list pages dir: {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let page: Option<Page> = read_json(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?;
            if let Some(page) = page {
                pages.push(page);
            }
        }

        pages.sort_by_key(|page| page.page_number);
        Ok(pages)
    }
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BookStatus, PageKind, PageSpec, PageStatus, expand_structure,
    };
    use chrono::Utc;

    fn sample_book(book_id: &str) -> Book {
        Book {
            book_id: book_id.to_string(),
            title: "Zoo Day".to_string(),
            status: BookStatus::Queued,
            structure: vec![PageSpec {
                kind: PageKind::Illustration,
                template_key: None,
                repeats: 3,
                scene_summary: None,
            }],
            reference_image_url: "https://example.com/jack.png".to_string(),
            print_format: None,
            artifact_path: None,
            error_detail: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn book_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalFsBookStore::new(dir.path());

        assert!(store.get_book("missing").await?.is_none());

        let book = sample_book("book-1");
        store.put_book(&book).await?;
        let loaded = store.get_book("book-1").await?.expect("book exists");
        assert_eq!(loaded.title, "Zoo Day");
        assert_eq!(loaded.status, BookStatus::Queued);
        Ok(())
    }

    #[tokio::test]
    async fn pages_listed_in_page_number_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalFsBookStore::new(dir.path());

        let book = sample_book("book-2");
        let mut pages = expand_structure(&book.book_id, &book.structure);
        // Write out of order; listing must sort.
        pages.reverse();
        for page in &pages {
            store.put_page(page).await?;
        }

        let listed = store.list_pages("book-2").await?;
        assert_eq!(listed.len(), 3);
        assert_eq!(
            listed.iter().map(|p| p.page_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(listed.iter().all(|p| p.status == PageStatus::Pending));
        Ok(())
    }

    #[tokio::test]
    async fn page_updates_overwrite_in_place() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalFsBookStore::new(dir.path());

        let book = sample_book("book-3");
        let mut pages = expand_structure(&book.book_id, &book.structure);
        for page in &pages {
            store.put_page(page).await?;
        }

        pages[1].status = PageStatus::Completed;
        pages[1].attempt_count = 2;
        store.put_page(&pages[1]).await?;

        let listed = store.list_pages("book-3").await?;
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[1].status, PageStatus::Completed);
        assert_eq!(listed[1].attempt_count, 2);
        Ok(())
    }
}
