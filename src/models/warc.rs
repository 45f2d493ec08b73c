// src/models/warc.rs

use serde::{Deserialize, Serialize};

/// A WARC waiting to be indexed, as listed by the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarcToIndex {
    pub id: u64,
    #[serde(default)]
    pub url_count: u64,
    /// Only present on sync listings
    #[serde(default)]
    pub resumption_token: Option<String>,
}

impl WarcToIndex {
    pub fn new(id: u64, url_count: u64) -> Self {
        Self {
            id,
            url_count,
            resumption_token: None,
        }
    }
}
