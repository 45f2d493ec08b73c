// src/models/content.rs

//! Content thresholds and search categories.

use serde::{Deserialize, Serialize};

/// How much of a document ends up in the index.
///
/// Variants are ordered so that each one includes everything indexed by
/// the ones before it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentThreshold {
    #[default]
    None,
    MetadataOnly,
    UniqueTermsOnly,
    DocumentStartOnly,
    FullText,
}

impl ContentThreshold {
    /// Whether any record is written at all.
    pub fn is_indexed(&self) -> bool {
        *self > ContentThreshold::None
    }

    /// Whether some form of the body text is written.
    pub fn includes_text(&self) -> bool {
        *self >= ContentThreshold::UniqueTermsOnly
    }
}

/// Coarse document kind exposed as a search facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchCategory {
    None,
    Html,
    Pdf,
    Document,
    Presentation,
    Spreadsheet,
}

const HTML_TYPES: &[&str] = &["text/html", "application/xhtml+xml"];

const PDF_TYPES: &[&str] = &["application/pdf"];

const DOCUMENT_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.oasis.opendocument.text",
    "application/rtf",
    "text/rtf",
];

const PRESENTATION_TYPES: &[&str] = &[
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.oasis.opendocument.presentation",
];

const SPREADSHEET_TYPES: &[&str] = &[
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.oasis.opendocument.spreadsheet",
    "text/csv",
    "application/csv",
];

impl SearchCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchCategory::None => "none",
            SearchCategory::Html => "html",
            SearchCategory::Pdf => "pdf",
            SearchCategory::Document => "document",
            SearchCategory::Presentation => "presentation",
            SearchCategory::Spreadsheet => "spreadsheet",
        }
    }

    /// Category for a content type, `None` when it is not searchable.
    ///
    /// Parameters such as `; charset=utf-8` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let essence = essence.as_str();

        if HTML_TYPES.contains(&essence) {
            Some(SearchCategory::Html)
        } else if PDF_TYPES.contains(&essence) {
            Some(SearchCategory::Pdf)
        } else if DOCUMENT_TYPES.contains(&essence) {
            Some(SearchCategory::Document)
        } else if PRESENTATION_TYPES.contains(&essence) {
            Some(SearchCategory::Presentation)
        } else if SPREADSHEET_TYPES.contains(&essence) {
            Some(SearchCategory::Spreadsheet)
        } else {
            None
        }
    }

    /// Office formats rank a little lower than web pages and PDFs.
    pub fn is_office_format(&self) -> bool {
        matches!(
            self,
            SearchCategory::Document | SearchCategory::Presentation | SearchCategory::Spreadsheet
        )
    }
}
