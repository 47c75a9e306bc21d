use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Persisted book states. The wire values are the external contract read by
/// the surrounding system and must not change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BookStatus {
    /// Record created but not yet accepted into the queue.
    #[serde(rename = "pendente")]
    Pending,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "gerando")]
    Generating,
    /// Generation finished; the book is complete but unpublished.
    #[serde(rename = "privado")]
    Completed,
    /// Published by a downstream action outside this pipeline.
    #[serde(rename = "publicado")]
    Published,
    #[serde(rename = "falha_geracao")]
    Failed,
}

impl BookStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Published | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl PageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Closed set of page shapes. Dispatch on this enum is exhaustive; adding a
/// variant forces every match site to handle it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    CoverFront,
    CoverBack,
    Intro,
    Illustration,
    Text,
    ColoringPage,
}

impl PageKind {
    /// Pages that carry a generated image and go through the provider →
    /// materializer sub-pipeline.
    pub fn bears_image(self) -> bool {
        match self {
            Self::CoverFront | Self::CoverBack | Self::Intro | Self::Illustration
            | Self::ColoringPage => true,
            Self::Text => false,
        }
    }

    /// Cover pages use the cover physical dimensions; everything else uses
    /// the interior dimensions.
    pub fn is_cover(self) -> bool {
        matches!(self, Self::CoverFront | Self::CoverBack)
    }

    /// Key used to look up this kind's prompt template in the configuration.
    pub fn template_key(self) -> &'static str {
        match self {
            Self::CoverFront => "cover_front",
            Self::CoverBack => "cover_back",
            Self::Intro => "intro",
            Self::Illustration => "illustration",
            Self::Text => "text",
            Self::ColoringPage => "coloring_page",
        }
    }
}

/// Physical print dimensions in millimeters. Covers and interior pages are
/// sized independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrintFormat {
    pub interior_width_mm: f64,
    pub interior_height_mm: f64,
    pub cover_width_mm: f64,
    pub cover_height_mm: f64,
    pub margin_mm: f64,
}

impl Default for PrintFormat {
    fn default() -> Self {
        // 210mm square picture-book trim.
        Self {
            interior_width_mm: 210.0,
            interior_height_mm: 210.0,
            cover_width_mm: 216.0,
            cover_height_mm: 216.0,
            margin_mm: 10.0,
        }
    }
}

/// One blueprint entry in a book's structure specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSpec {
    pub kind: PageKind,
    /// Overrides the kind's default template when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
    #[serde(default = "PageSpec::default_repeats")]
    pub repeats: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_summary: Option<String>,
}

impl PageSpec {
    pub fn default_repeats() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub book_id: String,
    pub title: String,
    pub status: BookStatus,
    pub structure: Vec<PageSpec>,
    pub reference_image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_format: Option<PrintFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub page_id: String,
    pub book_id: String,
    /// 1-based, dense, unique within the book.
    pub page_number: u32,
    pub kind: PageKind,
    pub status: PageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_summary: Option<String>,
    /// Resolved prompt sent to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Generated story text for `PageKind::Text` pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    /// Remote URL reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_url: Option<String>,
    /// Materialized path relative to the data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_asset_path: Option<String>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// How page prompts are derived before the per-page sub-pipeline runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeMode {
    /// One storyline call yields a scene description per illustration page.
    SingleTheme,
    /// Alternating text and illustration pages; text pages are produced from
    /// the running story summary.
    Interleaved,
}

/// Context map for prompt construction. Keys are upper-cased placeholder
/// names (`TITLE`, `CHARACTER_NAME`, `THEME`, plus free-form user inputs).
/// BTreeMap keeps serialized records and constructed prompts deterministic.
pub type PromptContext = BTreeMap<String, String>;

/// The queue payload: everything a worker needs to generate one book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// May be left empty in a submitted request; the enqueue command assigns
    /// a fresh id before the request reaches the queue.
    #[serde(default)]
    pub book_id: String,
    pub title: String,
    pub structure: Vec<PageSpec>,
    pub context: PromptContext,
    pub reference_image_url: String,
    /// Descriptions of the reference assets, appended to prompts as a style
    /// clause.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_descriptions: Vec<String>,
    pub narrative: NarrativeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_format: Option<PrintFormat>,
    /// Distinguishes generation attempts for the same book; duplicate
    /// enqueues with the same key are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl GenerationRequest {
    /// Checked before the request is accepted into the queue.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.title.trim().is_empty() {
            return Err(GenerationError::Validation("title is empty".into()));
        }
        if self.reference_image_url.trim().is_empty() {
            return Err(GenerationError::Validation(
                "missing character reference image".into(),
            ));
        }
        if self.structure.is_empty() {
            return Err(GenerationError::Validation(
                "structure specification is empty".into(),
            ));
        }
        if self.structure.iter().any(|spec| spec.repeats == 0) {
            return Err(GenerationError::Validation(
                "page spec has repeats = 0".into(),
            ));
        }
        if self.narrative == NarrativeMode::SingleTheme
            && self.structure.iter().any(|spec| spec.kind == PageKind::Text)
        {
            return Err(GenerationError::Validation(
                "single_theme books cannot contain text pages".into(),
            ));
        }
        Ok(())
    }
}

/// Expand a structure specification into concrete pages: apply `repeats`,
/// assign sequential 1-based page numbers. Pure; persistence is the caller's
/// concern.
pub fn expand_structure(book_id: &str, structure: &[PageSpec]) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut page_number = 0u32;

    for spec in structure {
        for _ in 0..spec.repeats.max(1) {
            page_number += 1;
            pages.push(Page {
                page_id: uuid::Uuid::new_v4().to_string(),
                book_id: book_id.to_owned(),
                page_number,
                kind: spec.kind,
                status: PageStatus::Pending,
                template_key: spec.template_key.clone(),
                scene_summary: spec.scene_summary.clone(),
                prompt: None,
                text_content: None,
                asset_url: None,
                local_asset_path: None,
                attempt_count: 0,
                error_detail: None,
            });
        }
    }

    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: PageKind, repeats: u32) -> PageSpec {
        PageSpec {
            kind,
            template_key: None,
            repeats,
            scene_summary: None,
        }
    }

    #[test]
    fn expansion_applies_repeats_with_dense_numbering() {
        let structure = vec![
            spec(PageKind::CoverFront, 1),
            spec(PageKind::Illustration, 3),
            spec(PageKind::ColoringPage, 2),
            spec(PageKind::CoverBack, 1),
        ];

        let pages = expand_structure("book-1", &structure);
        assert_eq!(pages.len(), 7);
        for (idx, page) in pages.iter().enumerate() {
            assert_eq!(page.page_number, idx as u32 + 1);
            assert_eq!(page.status, PageStatus::Pending);
            assert_eq!(page.attempt_count, 0);
        }
        assert_eq!(pages[0].kind, PageKind::CoverFront);
        assert_eq!(pages[3].kind, PageKind::Illustration);
        assert_eq!(pages[6].kind, PageKind::CoverBack);
    }

    #[test]
    fn book_status_wire_values_match_external_contract() {
        let cases = [
            (BookStatus::Pending, "\"pendente\""),
            (BookStatus::Queued, "\"queued\""),
            (BookStatus::Generating, "\"gerando\""),
            (BookStatus::Completed, "\"privado\""),
            (BookStatus::Published, "\"publicado\""),
            (BookStatus::Failed, "\"falha_geracao\""),
        ];
        for (status, expected) in cases {
            assert_eq!(serde_json::to_string(&status).unwrap(), expected);
        }
    }

    #[test]
    fn validate_rejects_missing_reference_image() {
        let request = GenerationRequest {
            book_id: "book-1".into(),
            title: "Zoo Day".into(),
            structure: vec![spec(PageKind::Illustration, 1)],
            context: PromptContext::new(),
            reference_image_url: "  ".into(),
            asset_descriptions: Vec::new(),
            narrative: NarrativeMode::SingleTheme,
            print_format: None,
            idempotency_key: None,
        };
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("character reference"));
    }

    #[test]
    fn text_pages_do_not_bear_images() {
        assert!(!PageKind::Text.bears_image());
        assert!(PageKind::Illustration.bears_image());
        assert!(PageKind::CoverFront.is_cover());
        assert!(!PageKind::Intro.is_cover());
    }
}
