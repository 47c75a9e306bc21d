//! Startup configuration, including the externalized prompt template set.
//!
//! Templates are data, not source constants: each page kind (plus the
//! storyline and narrative-text generators) is keyed in `templates`, so
//! prompt wording changes never require a rebuild.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "Config::default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub image_provider: ImageProviderConfig,
    #[serde(default)]
    pub text_provider: TextProviderConfig,
    /// Prompt templates keyed by page kind (`cover_front`, `illustration`,
    /// ...) plus `storyline` and `narrative_text`.
    #[serde(default = "default_templates")]
    pub templates: BTreeMap<String, String>,
}

impl Config {
    fn default_data_dir() -> PathBuf {
        PathBuf::from("data")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.generation.max_attempts == 0 {
            anyhow::bail!("generation.max_attempts must be >= 1");
        }
        if self.generation.max_polls == 0 {
            anyhow::bail!("generation.max_polls must be >= 1");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be >= 1");
        }
        for key in ["storyline", "narrative_text"] {
            if !self.templates.contains_key(key) {
                anyhow::bail!("templates.{key} is missing");
            }
        }
        Ok(())
    }

    pub fn template(&self, key: &str) -> anyhow::Result<&str> {
        self.templates
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("no prompt template configured for key: {key}"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            queue: QueueConfig::default(),
            generation: GenerationConfig::default(),
            image_provider: ImageProviderConfig::default(),
            text_provider: TextProviderConfig::default(),
            templates: default_templates(),
        }
    }
}

/// Durable queue tuning. Backoff and attempts apply to whole tasks; per-page
/// retries are `GenerationConfig`'s concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    #[serde(default = "QueueConfig::default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "QueueConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "QueueConfig::default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "QueueConfig::default_tick_ms")]
    pub tick_ms: u64,
    /// Overall deadline for one task, distinct from the per-page poll ceiling.
    #[serde(default = "QueueConfig::default_task_deadline_ms")]
    pub task_deadline_ms: u64,
}

impl QueueConfig {
    fn default_worker_concurrency() -> usize {
        2
    }
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_backoff_base_ms() -> u64 {
        5_000
    }
    fn default_tick_ms() -> u64 {
        500
    }
    fn default_task_deadline_ms() -> u64 {
        1_800_000
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
    pub fn task_deadline(&self) -> Duration {
        Duration::from_millis(self.task_deadline_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: Self::default_worker_concurrency(),
            max_attempts: Self::default_max_attempts(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            tick_ms: Self::default_tick_ms(),
            task_deadline_ms: Self::default_task_deadline_ms(),
        }
    }
}

/// Per-page generation tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Concurrent per-page sub-pipelines within one book.
    #[serde(default = "GenerationConfig::default_page_concurrency")]
    pub page_concurrency: usize,
    #[serde(default = "GenerationConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "GenerationConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "GenerationConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "GenerationConfig::default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "GenerationConfig::default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

impl GenerationConfig {
    fn default_page_concurrency() -> usize {
        4
    }
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_retry_delay_ms() -> u64 {
        5_000
    }
    fn default_poll_interval_ms() -> u64 {
        5_000
    }
    fn default_max_polls() -> u32 {
        30
    }
    fn default_max_prompt_chars() -> usize {
        4_000
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            page_concurrency: Self::default_page_concurrency(),
            max_attempts: Self::default_max_attempts(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            max_polls: Self::default_max_polls(),
            max_prompt_chars: Self::default_max_prompt_chars(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageProviderKind {
    /// Single request; the response carries the asset URL directly.
    SyncUrl,
    /// Submit returns a job id which is polled until completion.
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageProviderConfig {
    #[serde(default = "ImageProviderConfig::default_kind")]
    pub kind: ImageProviderKind,
    #[serde(default = "ImageProviderConfig::default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key, when the provider needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ImageProviderConfig {
    fn default_kind() -> ImageProviderKind {
        ImageProviderKind::Poll
    }
    fn default_base_url() -> String {
        "http://localhost:8188".to_string()
    }
}

impl Default for ImageProviderConfig {
    fn default() -> Self {
        Self {
            kind: Self::default_kind(),
            base_url: Self::default_base_url(),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextProviderConfig {
    #[serde(default = "TextProviderConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "TextProviderConfig::default_model")]
    pub model: String,
    #[serde(default = "TextProviderConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "TextProviderConfig::default_temperature")]
    pub temperature: f32,
}

impl TextProviderConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }
    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }
    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }
    fn default_temperature() -> f32 {
        0.7
    }
}

impl Default for TextProviderConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            temperature: Self::default_temperature(),
        }
    }
}

fn default_templates() -> BTreeMap<String, String> {
    let entries = [
        (
            "cover_front",
            "Book cover illustration for \"[TITLE]\", starring [CHARACTER_NAME]. \
             Theme: [THEME]. Bright, warm, child-friendly picture book style.",
        ),
        (
            "cover_back",
            "Back cover illustration matching the style of \"[TITLE]\". \
             Theme: [THEME]. Simple composition with room for text.",
        ),
        (
            "intro",
            "Introduction page illustration showing [CHARACTER_NAME] waving hello. \
             Theme: [THEME].",
        ),
        (
            "illustration",
            "Children's book illustration: [SCENE]. Featuring [CHARACTER_NAME], \
             [CHARACTER_DESCRIPTION]. Theme: [THEME].",
        ),
        (
            "coloring_page",
            "Black and white coloring page line art: [SCENE]. Featuring \
             [CHARACTER_NAME]. Clean outlines, no shading, no text.",
        ),
        (
            "storyline",
            "Write [SCENE_COUNT] short scene descriptions for a children's picture \
             book titled \"[TITLE]\" about [CHARACTER_NAME]. Theme: [THEME]. \
             One scene per line, no numbering.",
        ),
        (
            "narrative_text",
            "Continue the story of \"[TITLE]\" starring [CHARACTER_NAME]. \
             Theme: [THEME]. Write one short paragraph for the next page.",
        ),
    ];
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
