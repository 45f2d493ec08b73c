// src/services/search.rs

//! Search engine client.
//!
//! Records are written through the Solr JSON update API, rule outcomes are
//! patched with atomic `set` updates, and indexed documents are paged back
//! with cursor marks for reconciliation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AppError, Result};
use crate::models::{Policy, SearchCategory, SearchConfig};
use crate::utils::http::{create_async_client, send_checked, send_json};

/// Cursor mark that starts a fresh traversal.
pub const START_CURSOR: &str = "*";

/// A fully built index record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRecord {
    pub id: String,
    pub url: String,
    pub delivery_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pandora_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub date: DateTime<Utc>,
    pub year: i32,
    pub decade: i32,
    pub site: String,
    pub host: String,
    pub host_reversed: String,
    pub surt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<String>,
    pub au_gov: bool,
    pub rule_id: u64,
    pub policy: Policy,
    pub deliverable: bool,
    pub discoverable: bool,
    pub text_error: bool,
    pub search_category: SearchCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulltext: Option<String>,
    pub boost: f32,
    pub last_indexed: DateTime<Utc>,
}

/// New rule outcome for an already indexed record.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    pub id: String,
    pub rule_id: u64,
    pub policy: Policy,
    pub deliverable: bool,
    pub discoverable: bool,
    pub last_indexed: DateTime<Utc>,
}

impl PartialUpdate {
    /// Atomic update document in Solr's `set` syntax.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "ruleId": { "set": self.rule_id },
            "policy": { "set": self.policy.as_str() },
            "deliverable": { "set": self.deliverable },
            "discoverable": { "set": self.discoverable },
            "lastIndexed": { "set": format_date(self.last_indexed) },
        })
    }
}

/// Restriction on the records returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFilter {
    RuleId(u64),
    SurtPrefix(String),
    SurtExact(String),
    /// Capture date inside the range, either end open
    CapturedBetween(Option<DateTime<Utc>>, Option<DateTime<Utc>>),
    /// `lastIndexed` at or before the watermark
    NotIndexedSince(DateTime<Utc>),
}

impl QueryFilter {
    /// Filter query clause for this restriction.
    pub fn to_fq(&self) -> String {
        match self {
            QueryFilter::RuleId(id) => format!("ruleId:{id}"),
            QueryFilter::SurtPrefix(surt) => format!("surt:{}*", escape_query_chars(surt)),
            QueryFilter::SurtExact(surt) => format!("surt:{}", escape_query_chars(surt)),
            QueryFilter::CapturedBetween(from, to) => {
                format!("date:[{} TO {}]", range_end(*from), range_end(*to))
            }
            QueryFilter::NotIndexedSince(watermark) => {
                format!("lastIndexed:[* TO {}]", format_date(*watermark))
            }
        }
    }
}

/// A query over indexed records, paged by cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub filters: Vec<QueryFilter>,
    pub rows: usize,
}

impl SearchQuery {
    pub fn new(rows: usize) -> Self {
        Self {
            filters: Vec::new(),
            rows,
        }
    }

    pub fn filter(mut self, filter: QueryFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// The slice of an indexed record needed to re-evaluate its rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedHit {
    pub id: String,
    pub delivery_url: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub rule_id: Option<u64>,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub hits: Vec<IndexedHit>,
    /// `None` once the traversal is complete
    pub next_cursor: Option<String>,
}

/// Writes to and queries the search index.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn upsert(&self, record: &SearchRecord) -> Result<()>;

    async fn partial_update(&self, update: &PartialUpdate) -> Result<()>;

    /// Fetch the page starting at `cursor`, ordered by id.
    async fn query(&self, query: &SearchQuery, cursor: &str) -> Result<QueryPage>;

    /// Make all prior writes visible to queries.
    async fn commit(&self) -> Result<()>;
}

/// Solr implementation of [`SearchEngine`].
pub struct SolrClient {
    base_url: String,
    commit_within_ms: u64,
    client: Client,
}

#[derive(Deserialize)]
struct SelectResponse {
    response: SelectDocs,
    #[serde(rename = "nextCursorMark")]
    next_cursor_mark: Option<String>,
}

#[derive(Deserialize)]
struct SelectDocs {
    docs: Vec<IndexedHit>,
}

impl SolrClient {
    pub fn new(config: &SearchConfig, user_agent: &str) -> Result<Self> {
        Ok(Self {
            base_url: config.base_url.clone(),
            commit_within_ms: config.commit_within_ms,
            client: create_async_client(user_agent, config.timeout_secs)?,
        })
    }

    async fn post_update(&self, body: &Value, context: &str) -> Result<()> {
        let url = format!("{}update", self.base_url);
        let request = self
            .client
            .post(&url)
            .query(&[("commitWithin", self.commit_within_ms.to_string())])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?);
        send_checked(request, context).await.map(|_| ())
    }
}

#[async_trait]
impl SearchEngine for SolrClient {
    async fn upsert(&self, record: &SearchRecord) -> Result<()> {
        let body = Value::Array(vec![serde_json::to_value(record)?]);
        self.post_update(&body, &format!("index {}", record.id))
            .await
    }

    async fn partial_update(&self, update: &PartialUpdate) -> Result<()> {
        let body = Value::Array(vec![update.to_json()]);
        self.post_update(&body, &format!("update {}", update.id))
            .await
    }

    async fn query(&self, query: &SearchQuery, cursor: &str) -> Result<QueryPage> {
        let url = format!("{}select", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("q", "*:*".to_string()),
            ("wt", "json".to_string()),
            ("fl", "id,deliveryUrl,date,ruleId".to_string()),
            ("sort", "id asc".to_string()),
            ("rows", query.rows.to_string()),
            ("cursorMark", cursor.to_string()),
        ];
        for filter in &query.filters {
            params.push(("fq", filter.to_fq()));
        }

        let response: SelectResponse =
            send_json(self.client.get(&url).query(&params), "search query").await?;
        let next_cursor = match response.next_cursor_mark {
            Some(next) if next != cursor => Some(next),
            Some(_) => None,
            None => {
                return Err(AppError::upstream(
                    "search query",
                    "response carries no cursor mark",
                ));
            }
        };
        Ok(QueryPage {
            hits: response.response.docs,
            next_cursor,
        })
    }

    async fn commit(&self) -> Result<()> {
        let url = format!("{}update", self.base_url);
        let request = self.client.get(&url).query(&[("commit", "true")]);
        send_checked(request, "search commit").await.map(|_| ())
    }
}

fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn range_end(date: Option<DateTime<Utc>>) -> String {
    date.map_or_else(|| "*".to_string(), format_date)
}

/// Backslash-escape the characters the query parser treats specially.
pub fn escape_query_chars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 2);
    for c in raw.chars() {
        if matches!(
            c,
            '\\' | '+'
                | '-'
                | '!'
                | '('
                | ')'
                | ':'
                | '^'
                | '['
                | ']'
                | '"'
                | '{'
                | '}'
                | '~'
                | '*'
                | '?'
                | '|'
                | '&'
                | ';'
                | '/'
                | ','
        ) || c.is_whitespace()
        {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
