// src/services/archive.rs

//! Archive client.
//!
//! Fetches the extracted documents of a WARC and lists WARCs waiting to be
//! indexed, either by id range or by sync resumption token.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;
use crate::models::{ArchiveConfig, Document, WarcToIndex};
use crate::utils::http::{create_async_client, send_json};

/// Source of archived documents and WARC listings.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// All documents of one WARC. `bypass_cache` asks the archive to
    /// re-extract instead of serving a cached copy.
    async fn fetch_documents(&self, warc_id: u64, bypass_cache: bool) -> Result<Vec<Document>>;

    /// WARCs of a collection in id order, starting at `start`.
    async fn list_warcs(
        &self,
        collection_id: u64,
        start: u64,
        rows: usize,
    ) -> Result<Vec<WarcToIndex>>;

    /// WARCs that changed since the resumption token `after`.
    async fn sync_warcs(
        &self,
        collection_id: u64,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WarcToIndex>>;
}

/// HTTP implementation of [`ArchiveSource`].
pub struct ArchiveClient {
    base_url: String,
    client: Client,
}

impl ArchiveClient {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            client: create_async_client(&config.user_agent, config.timeout_secs)?,
        })
    }

    fn text_url(&self, warc_id: u64, bypass_cache: bool) -> String {
        let mut url = format!("{}warcs/{}/text?tika=1&pdfbox=1", self.base_url, warc_id);
        if bypass_cache {
            url.push_str("&bypass=1");
        }
        url
    }
}

#[async_trait]
impl ArchiveSource for ArchiveClient {
    async fn fetch_documents(&self, warc_id: u64, bypass_cache: bool) -> Result<Vec<Document>> {
        let url = self.text_url(warc_id, bypass_cache);
        let context = format!("warc {warc_id}");
        send_json(self.client.get(&url), &context).await
    }

    async fn list_warcs(
        &self,
        collection_id: u64,
        start: u64,
        rows: usize,
    ) -> Result<Vec<WarcToIndex>> {
        let url = format!("{}collections/{}/warcs/json", self.base_url, collection_id);
        let request = self
            .client
            .get(&url)
            .query(&[("start", start.to_string()), ("rows", rows.to_string())]);
        send_json(request, &format!("collection {collection_id} listing")).await
    }

    async fn sync_warcs(
        &self,
        collection_id: u64,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WarcToIndex>> {
        let url = format!("{}collections/{}/warcs/sync", self.base_url, collection_id);
        let mut params = vec![("limit", limit.to_string())];
        if let Some(token) = after {
            params.push(("after", token.to_string()));
        }
        let request = self.client.get(&url).query(&params);
        send_json(request, &format!("collection {collection_id} sync")).await
    }
}
