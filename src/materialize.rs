//! Asset materialization: turn a provider-hosted asset URL into a durable
//! local file under the data dir.
//!
//! Callers treat a failure here exactly like a provider failure when deciding
//! whether to retry, so everything maps to `GenerationError::Persistence`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;

use crate::error::GenerationError;

#[async_trait]
pub trait Materialize: Send + Sync {
    /// Download `remote_url` into durable storage and return a stable path
    /// relative to the data dir.
    async fn materialize(&self, remote_url: &str) -> Result<String, GenerationError>;
}

pub struct HttpMaterializer {
    client: reqwest::Client,
    data_dir: PathBuf,
}

impl HttpMaterializer {
    pub fn new(client: reqwest::Client, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            data_dir: data_dir.into(),
        }
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.data_dir.join(relative)
    }
}

#[async_trait]
impl Materialize for HttpMaterializer {
    async fn materialize(&self, remote_url: &str) -> Result<String, GenerationError> {
        let response = self
            .client
            .get(remote_url)
            .send()
            .await
            .map_err(|err| GenerationError::Persistence(format!("GET {remote_url}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Persistence(format!(
                "asset download failed ({status}): {remote_url}"
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let extension = infer_extension(remote_url, content_type.as_deref());

        let assets_dir = self.data_dir.join("assets");
        tokio::fs::create_dir_all(&assets_dir)
            .await
            .map_err(|err| {
                GenerationError::Persistence(format!(
                    "create assets dir {}: {err}",
                    assets_dir.display()
                ))
            })?;

        let file_name = format!("{}{extension}", uuid::Uuid::new_v4().simple());
        let path = assets_dir.join(&file_name);
        let mut file = tokio::fs::File::create(&path).await.map_err(|err| {
            GenerationError::Persistence(format!("create {}: {err}", path.display()))
        })?;

        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|err| {
            GenerationError::Persistence(format!("stream {remote_url}: {err}"))
        })? {
            file.write_all(&chunk).await.map_err(|err| {
                GenerationError::Persistence(format!("write {}: {err}", path.display()))
            })?;
        }
        file.flush().await.map_err(|err| {
            GenerationError::Persistence(format!("flush {}: {err}", path.display()))
        })?;

        Ok(format!("assets/{file_name}"))
    }
}

/// Prefer the extension in the URL path; fall back to the content type; keep
/// `.bin` when neither is usable.
fn infer_extension(remote_url: &str, content_type: Option<&str>) -> String {
    if let Some(ext) = extension_from_url_path(remote_url) {
        return ext;
    }

    let mapped = match content_type.map(|ct| ct.split(';').next().unwrap_or(ct).trim()) {
        Some("image/png") => Some(".png"),
        Some("image/jpeg") => Some(".jpg"),
        Some("image/webp") => Some(".webp"),
        Some("application/pdf") => Some(".pdf"),
        _ => None,
    };
    mapped.unwrap_or(".bin").to_string()
}

fn extension_from_url_path(remote_url: &str) -> Option<String> {
    let without_fragment = remote_url.split('#').next()?;
    let without_query = without_fragment.split('?').next()?;
    let file_name = without_query.rsplit('/').next()?;
    let ext = Path::new(file_name).extension()?.to_str()?;

    let valid = !ext.is_empty()
        && ext.len() <= 5
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_prefers_url_path() {
        assert_eq!(
            infer_extension("https://cdn.example.com/a/b/cat.PNG?sig=abc", None),
            ".png"
        );
        assert_eq!(
            infer_extension("https://cdn.example.com/x.jpg#frag", Some("image/webp")),
            ".jpg"
        );
    }

    #[test]
    fn extension_falls_back_to_content_type() {
        assert_eq!(
            infer_extension("https://cdn.example.com/asset", Some("image/png")),
            ".png"
        );
        assert_eq!(
            infer_extension(
                "https://cdn.example.com/asset",
                Some("image/jpeg; charset=binary")
            ),
            ".jpg"
        );
    }

    #[test]
    fn unknown_extension_is_bin() {
        assert_eq!(infer_extension("https://cdn.example.com/asset", None), ".bin");
        assert_eq!(
            infer_extension("https://cdn.example.com/archive.tar.gz.sha256sum", None),
            ".bin"
        );
    }
}
