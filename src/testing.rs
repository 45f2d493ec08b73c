// src/testing.rs

//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{AppError, Result};
use crate::models::{Document, RuleRecord, WarcToIndex};
use crate::services::{
    ArchiveSource, IndexedHit, PartialUpdate, QueryFilter, QueryPage, RuleFeed, SearchEngine,
    SearchQuery, SearchRecord,
};

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A harvested HTML page at `offset` in its WARC.
pub fn document(url: &str, offset: i64) -> Document {
    let site = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_default();
    Document {
        url: url.to_string(),
        delivery_url: Some(url.to_string()),
        date: date(2015, 3, 1),
        status_code: 200,
        content_length: 100,
        content_type: "text/html".into(),
        title: Some("A page".into()),
        text: Some("Some body text about the archive".into()),
        host: site.clone(),
        site,
        warc_offset: offset,
        ..Document::default()
    }
}

#[derive(Default)]
pub struct MemoryRuleFeed {
    rules: Mutex<Vec<RuleRecord>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryRuleFeed {
    pub fn new(rules: Vec<RuleRecord>) -> Self {
        Self {
            rules: Mutex::new(rules),
            ..Self::default()
        }
    }

    pub fn set_rules(&self, rules: Vec<RuleRecord>) {
        *self.rules.lock().unwrap() = rules;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleFeed for MemoryRuleFeed {
    async fn fetch_rules(&self) -> Result<Vec<RuleRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::upstream("rule feed", "connection refused"));
        }
        Ok(self.rules.lock().unwrap().clone())
    }
}

/// Archive holding documents per WARC and an ordered WARC listing.
#[derive(Default)]
pub struct MemoryArchive {
    documents: Mutex<HashMap<u64, Vec<Document>>>,
    warcs: Mutex<Vec<WarcToIndex>>,
    /// WARCs whose fetch fails this many more times
    failures: Mutex<HashMap<u64, usize>>,
    failing_listings: AtomicUsize,
    fetches: Mutex<Vec<(u64, bool)>>,
    /// WARCs whose fetch waits until released
    held: Mutex<HashSet<u64>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a WARC with its documents; the listing keeps id order.
    pub fn add_warc(&self, id: u64, documents: Vec<Document>) {
        let mut warc = WarcToIndex::new(id, documents.len() as u64);
        warc.resumption_token = Some(format!("token-{id}"));
        self.documents.lock().unwrap().insert(id, documents);
        let mut warcs = self.warcs.lock().unwrap();
        warcs.push(warc);
        warcs.sort_by_key(|w| w.id);
    }

    pub fn fail_fetches(&self, id: u64, times: usize) {
        self.failures.lock().unwrap().insert(id, times);
    }

    pub fn hold_fetches(&self, id: u64) {
        self.held.lock().unwrap().insert(id);
    }

    pub fn release_fetches(&self, id: u64) {
        self.held.lock().unwrap().remove(&id);
    }

    pub fn fail_listings(&self, times: usize) {
        self.failing_listings.store(times, Ordering::SeqCst);
    }

    /// Every fetch so far as `(warc id, bypass flag)`.
    pub fn fetches(&self) -> Vec<(u64, bool)> {
        self.fetches.lock().unwrap().clone()
    }

    fn is_held(&self, id: u64) -> bool {
        self.held.lock().unwrap().contains(&id)
    }

    fn listing_fails(&self) -> bool {
        self.failing_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ArchiveSource for MemoryArchive {
    async fn fetch_documents(&self, warc_id: u64, bypass_cache: bool) -> Result<Vec<Document>> {
        self.fetches.lock().unwrap().push((warc_id, bypass_cache));
        while self.is_held(warc_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&warc_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AppError::upstream(format!("warc {warc_id}"), "HTTP 500"));
                }
            }
        }
        self.documents
            .lock()
            .unwrap()
            .get(&warc_id)
            .cloned()
            .ok_or_else(|| AppError::upstream(format!("warc {warc_id}"), "HTTP 404"))
    }

    async fn list_warcs(
        &self,
        _collection_id: u64,
        start: u64,
        rows: usize,
    ) -> Result<Vec<WarcToIndex>> {
        if self.listing_fails() {
            return Err(AppError::upstream("listing", "HTTP 503"));
        }
        Ok(self
            .warcs
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.id >= start)
            .take(rows)
            .cloned()
            .collect())
    }

    async fn sync_warcs(
        &self,
        _collection_id: u64,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WarcToIndex>> {
        if self.listing_fails() {
            return Err(AppError::upstream("sync", "HTTP 503"));
        }
        let warcs = self.warcs.lock().unwrap();
        let skip = match after {
            Some(token) => warcs
                .iter()
                .position(|w| w.resumption_token.as_deref() == Some(token))
                .map_or(0, |i| i + 1),
            None => 0,
        };
        Ok(warcs.iter().skip(skip).take(limit).cloned().collect())
    }
}

/// Search index kept in a map ordered by record id.
#[derive(Default)]
pub struct MemorySearch {
    records: Mutex<BTreeMap<String, SearchRecord>>,
    updates: Mutex<Vec<PartialUpdate>>,
    failing_ids: Mutex<HashSet<String>>,
    fail_updates: AtomicBool,
    fail_queries: AtomicBool,
    commits: AtomicUsize,
    queries: AtomicUsize,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: SearchRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<SearchRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn updates(&self) -> Vec<PartialUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Make upserts of this record id fail.
    pub fn fail_id(&self, id: &str) {
        self.failing_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn set_fail_updates(&self, failing: bool) {
        self.fail_updates.store(failing, Ordering::SeqCst);
    }

    pub fn set_fail_queries(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }
}

fn accepts(filter: &QueryFilter, record: &SearchRecord) -> bool {
    match filter {
        QueryFilter::RuleId(id) => record.rule_id == *id,
        QueryFilter::SurtPrefix(prefix) => record.surt.starts_with(prefix.as_str()),
        QueryFilter::SurtExact(surt) => record.surt == *surt,
        QueryFilter::CapturedBetween(from, to) => {
            from.is_none_or(|f| record.date >= f) && to.is_none_or(|t| record.date <= t)
        }
        QueryFilter::NotIndexedSince(watermark) => record.last_indexed <= *watermark,
    }
}

#[async_trait]
impl SearchEngine for MemorySearch {
    async fn upsert(&self, record: &SearchRecord) -> Result<()> {
        if self.failing_ids.lock().unwrap().contains(&record.id) {
            return Err(AppError::upstream(format!("index {}", record.id), "HTTP 500"));
        }
        self.insert(record.clone());
        Ok(())
    }

    async fn partial_update(&self, update: &PartialUpdate) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(AppError::upstream(format!("update {}", update.id), "HTTP 500"));
        }
        if let Some(record) = self.records.lock().unwrap().get_mut(&update.id) {
            record.rule_id = update.rule_id;
            record.policy = update.policy;
            record.deliverable = update.deliverable;
            record.discoverable = update.discoverable;
            record.last_indexed = update.last_indexed;
        }
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn query(&self, query: &SearchQuery, cursor: &str) -> Result<QueryPage> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(AppError::upstream("search query", "HTTP 500"));
        }
        let records = self.records.lock().unwrap();
        let hits: Vec<IndexedHit> = records
            .values()
            .filter(|r| cursor == "*" || r.id.as_str() > cursor)
            .filter(|r| query.filters.iter().all(|f| accepts(f, r)))
            .take(query.rows)
            .map(|r| IndexedHit {
                id: r.id.clone(),
                delivery_url: r.delivery_url.clone(),
                date: r.date,
                rule_id: Some(r.rule_id),
            })
            .collect();
        let next_cursor = match hits.last() {
            Some(last) if hits.len() == query.rows => Some(last.id.clone()),
            _ => None,
        };
        Ok(QueryPage { hits, next_cursor })
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
