// src/services/rules.rs

//! Rule feed client.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::Result;
use crate::models::RuleRecord;
use crate::utils::http::{create_async_client, send_json};

/// Source of the authoritative restriction rule list.
#[async_trait]
pub trait RuleFeed: Send + Sync {
    /// Every rule currently defined, unvalidated.
    async fn fetch_rules(&self) -> Result<Vec<RuleRecord>>;
}

/// Rule feed served as a JSON array over HTTP.
pub struct HttpRuleFeed {
    url: String,
    client: Client,
}

impl HttpRuleFeed {
    pub fn new(url: impl Into<String>, user_agent: &str, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            client: create_async_client(user_agent, timeout_secs)?,
        })
    }
}

#[async_trait]
impl RuleFeed for HttpRuleFeed {
    async fn fetch_rules(&self) -> Result<Vec<RuleRecord>> {
        let rules: Vec<RuleRecord> = send_json(self.client.get(&self.url), "rule feed").await?;
        log::debug!("Fetched {} rules from {}", rules.len(), self.url);
        Ok(rules)
    }
}
