// src/models/document.rs

//! Archived documents as served by the archive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A collection a document was harvested into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// One archived document extracted from a WARC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub url: String,
    #[serde(default)]
    pub delivery_url: Option<String>,
    #[serde(default)]
    pub pandora_url: Option<String>,
    /// Capture time, epoch milliseconds on the wire
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub text_error: Option<String>,
    #[serde(default)]
    pub site: String,
    #[serde(default)]
    pub host: String,
    pub warc_offset: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub contributor: Option<String>,
    #[serde(default)]
    pub coverage: Option<String>,
    #[serde(default)]
    pub collections: Vec<CollectionInfo>,
}

impl Document {
    pub fn in_collection(&self, collection_id: u64) -> bool {
        self.collections.iter().any(|c| c.id == collection_id)
    }

    /// Descriptive metadata fields that carry a value.
    pub fn metadata(&self) -> impl Iterator<Item = &str> {
        [
            &self.description,
            &self.keywords,
            &self.publisher,
            &self.creator,
            &self.contributor,
            &self.coverage,
        ]
        .into_iter()
        .filter_map(|field| field.as_deref())
        .filter(|value| !value.trim().is_empty())
    }
}
