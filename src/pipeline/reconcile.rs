// src/pipeline/reconcile.rs

//! Re-evaluation of already indexed documents after rules change.
//!
//! A run holds the pipeline's rule gate exclusively, so no new WARC is
//! acquired while it works, and only starts once the pipeline has drained.
//! It first revisits documents affected by the passage of time (embargoes
//! and retrieval ranges), then every rule that changed in the feed. Each
//! affected document gets a partial update carrying its freshly evaluated
//! rule. Progress is logged per rule so an interrupted run resumes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::error::{AppError, Result};
use crate::models::{RestrictionsConfig, Rule, SearchConfig};
use crate::pipeline::coordinator::Clock;
use crate::pipeline::stages::StagePipeline;
use crate::pipeline::window::{next_daily_run, time_of_day};
use crate::restrictions::{ChangeReason, RuleChange, RuleManager};
use crate::services::{
    IndexedHit, PartialUpdate, QueryFilter, START_CURSOR, SearchEngine, SearchQuery,
};
use crate::storage::{LastRun, WorkTotals};

/// Work done on behalf of a single rule.
struct WorkLog {
    totals: WorkTotals,
    started: Instant,
}

impl WorkLog {
    fn new() -> Self {
        Self {
            totals: WorkTotals {
                rules: 1,
                ..WorkTotals::default()
            },
            started: Instant::now(),
        }
    }

    fn finish(mut self) -> WorkTotals {
        self.totals.elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.totals
    }
}

pub struct RuleChangeReconciler {
    manager: Arc<RuleManager>,
    search: Arc<dyn SearchEngine>,
    pipeline: Arc<StagePipeline>,
    page_size: usize,
    workers: usize,
    schedule: NaiveTime,
    clock: Clock,
}

impl RuleChangeReconciler {
    pub fn new(
        manager: Arc<RuleManager>,
        search: Arc<dyn SearchEngine>,
        pipeline: Arc<StagePipeline>,
        search_config: &SearchConfig,
        config: &RestrictionsConfig,
    ) -> Result<Self> {
        Ok(Self {
            manager,
            search,
            pipeline,
            page_size: search_config.page_size.max(1),
            workers: config.recheck_workers.max(1),
            schedule: time_of_day(config.schedule_hour, config.schedule_minute)?,
            clock: Arc::new(|| Local::now().naive_local()),
        })
    }

    pub fn manager(&self) -> &Arc<RuleManager> {
        &self.manager
    }

    /// Run one reconciliation, resuming an interrupted one if needed.
    ///
    /// Any failure aborts the run: the current rule set stays in use and
    /// the staged set is kept for the next attempt.
    pub async fn run(&self) -> Result<LastRun> {
        let _gate = self.pipeline.rule_gate().write().await;
        self.pipeline.wait_until_idle().await;

        match self.run_phases().await {
            Ok(run) => {
                log::info!(
                    "Reconciliation run {} finished: {} rules, {} searches, {} documents updated",
                    run.id,
                    run.totals.rules,
                    run.totals.searches,
                    run.totals.written
                );
                Ok(run)
            }
            Err(e) => {
                self.manager.abort_run(&e.to_string()).await;
                Err(AppError::reconcile(e))
            }
        }
    }

    async fn run_phases(&self) -> Result<LastRun> {
        let run = self.manager.start_run().await?;
        let engine = self.manager.engine();

        let date_rules = self.manager.date_rules().await;
        if !date_rules.is_empty() {
            let watermark = run.date_completed.unwrap_or(run.started);
            let today = engine.now();
            log::info!("Checking {} date based rules", date_rules.len());
            for rule in date_rules {
                let mut work = WorkLog::new();
                self.process_date_rule(&rule, today, watermark, &mut work)
                    .await?;
                self.manager.store_work_log(rule.id(), &work.finish()).await?;
            }
        }

        let watermark = self.manager.finish_date_rules().await?;
        let today = engine.now();

        if let Some(mut diff) = self.manager.check_for_changed_rules().await? {
            log::info!(
                "Processing {} rule changes ({} new, {} changed, {} deleted)",
                diff.len(),
                diff.count(ChangeReason::New),
                diff.count(ChangeReason::Changed),
                diff.count(ChangeReason::Deleted)
            );
            while let Some(change) = diff.next() {
                let mut work = WorkLog::new();
                self.process_change(&change, today, watermark, &mut work)
                    .await?;
                self.manager
                    .store_work_log(change.id(), &work.finish())
                    .await?;
            }
        }

        self.manager.finish_run().await
    }

    async fn process_date_rule(
        &self,
        rule: &Rule,
        today: DateTime<Utc>,
        watermark: DateTime<Utc>,
        work: &mut WorkLog,
    ) -> Result<()> {
        if let Some(range) = rule.retrieved() {
            if range.contains(today) {
                self.process_query(url_query(rule, self.page_size), watermark, work)
                    .await?;
            } else {
                self.process_query(rule_query(rule, self.page_size), watermark, work)
                    .await?;
            }
        }

        if let Some(embargo) = rule.embargo() {
            let released = rule_query(rule, self.page_size)
                .filter(QueryFilter::CapturedBetween(None, Some(today - embargo)));
            self.process_query(released, watermark, work).await?;
            self.process_query(url_query(rule, self.page_size), watermark, work)
                .await?;
        }
        Ok(())
    }

    async fn process_change(
        &self,
        change: &RuleChange,
        today: DateTime<Utc>,
        watermark: DateTime<Utc>,
        work: &mut WorkLog,
    ) -> Result<()> {
        log::info!("Rule {} {}", change.id(), change.reason);
        match change.reason {
            ChangeReason::New => {
                let rule = &change.rule;
                if rule.retrieved().is_some_and(|r| !r.contains(today)) {
                    return Ok(());
                }
                self.process_query(url_query(rule, self.page_size), watermark, work)
                    .await
            }
            ChangeReason::Deleted => {
                self.process_query(rule_query(&change.rule, self.page_size), watermark, work)
                    .await
            }
            ChangeReason::Changed => {
                self.process_query(rule_query(&change.rule, self.page_size), watermark, work)
                    .await?;
                if let Some(new_rule) = &change.new_rule {
                    if change.rule.scope_differs(new_rule) {
                        self.process_query(url_query(new_rule, self.page_size), watermark, work)
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Page through every hit of `query` indexed no later than `watermark`.
    ///
    /// The cursor only advances once every update of the page succeeded.
    async fn process_query(
        &self,
        query: SearchQuery,
        watermark: DateTime<Utc>,
        work: &mut WorkLog,
    ) -> Result<()> {
        let query = query.filter(QueryFilter::NotIndexedSince(watermark));
        self.search.commit().await?;

        let mut cursor = START_CURSOR.to_string();
        loop {
            let page = self.search.query(&query, &cursor).await?;
            work.totals.searches += 1;
            let found = page.hits.len() as u64;

            let results: Vec<Result<()>> = stream::iter(page.hits)
                .map(|hit| self.recheck(hit))
                .buffer_unordered(self.workers)
                .collect()
                .await;
            for result in results {
                result?;
            }
            work.totals.documents += found;
            work.totals.written += found;

            match page.next_cursor {
                Some(next) if next != cursor => cursor = next,
                _ => return Ok(()),
            }
        }
    }

    /// Boost only depends on the site and content, so it is left as indexed.
    async fn recheck(&self, hit: IndexedHit) -> Result<()> {
        let rule = self
            .manager
            .engine()
            .filter_document(&hit.delivery_url, hit.date)?;
        let policy = rule.policy();
        let update = PartialUpdate {
            id: hit.id,
            rule_id: rule.id(),
            policy,
            deliverable: policy.is_deliverable(),
            discoverable: policy.is_discoverable(),
            last_indexed: Utc::now(),
        };
        self.search.partial_update(&update).await
    }

    /// Run daily at the configured local time until `stop` fires.
    ///
    /// Runs immediately first when the rules are in recovery or the last
    /// completed run is more than a day old.
    pub async fn run_scheduled(&self, mut stop: watch::Receiver<bool>) {
        if self.manager.needs_run_now().await {
            log::info!("Rule reconciliation is overdue, running now");
            self.run_logged().await;
        }

        loop {
            let now = (self.clock)();
            let next = next_daily_run(now, self.schedule);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            log::info!("Next rule reconciliation at {}", next);

            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return,
                _ = tokio::time::sleep(wait) => {}
            }
            self.run_logged().await;
        }
    }

    async fn run_logged(&self) {
        if let Err(e) = self.run().await {
            log::error!("{}", e);
        }
    }
}

fn rule_query(rule: &Rule, rows: usize) -> SearchQuery {
    SearchQuery::new(rows).filter(QueryFilter::RuleId(rule.id()))
}

fn url_query(rule: &Rule, rows: usize) -> SearchQuery {
    let surt = rule.surt().to_string();
    let query = SearchQuery::new(rows);
    if rule.is_exact() {
        query.filter(QueryFilter::SurtExact(surt))
    } else {
        query.filter(QueryFilter::SurtPrefix(surt))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeDelta};
    use tempfile::TempDir;

    use super::*;
    use crate::models::{PipelineConfig, Policy, RuleRecord, SearchCategory};
    use crate::services::SearchRecord;
    use crate::storage::LocalStorage;
    use crate::testing::{MemoryRuleFeed, MemorySearch, date};
    use crate::utils::url::to_surt;

    struct Harness {
        _dir: TempDir,
        feed: Arc<MemoryRuleFeed>,
        search: Arc<MemorySearch>,
        reconciler: RuleChangeReconciler,
    }

    async fn harness(rules: &[Rule], page_size: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let feed = Arc::new(MemoryRuleFeed::new(records(rules)));
        let store = Arc::new(LocalStorage::new(dir.path()));
        let manager = Arc::new(RuleManager::initialise(store, feed.clone()).await.unwrap());
        let search = Arc::new(MemorySearch::new());
        let pipeline = Arc::new(StagePipeline::new(
            manager.engine(),
            Arc::clone(&search) as Arc<dyn SearchEngine>,
            &PipelineConfig {
                poll_interval_ms: 5,
                ..PipelineConfig::default()
            },
            4,
        ));
        let reconciler = RuleChangeReconciler::new(
            manager,
            Arc::clone(&search) as Arc<dyn SearchEngine>,
            pipeline,
            &SearchConfig {
                page_size,
                ..SearchConfig::default()
            },
            &RestrictionsConfig::default(),
        )
        .unwrap();
        Harness {
            _dir: dir,
            feed,
            search,
            reconciler,
        }
    }

    fn records(rules: &[Rule]) -> Vec<RuleRecord> {
        rules.iter().map(Rule::to_record).collect()
    }

    fn catch_all() -> Rule {
        Rule::builder(1, Policy::Accepted, "(").build().unwrap()
    }

    fn indexed(id: &str, url: &str, captured: DateTime<Utc>, rule_id: u64) -> SearchRecord {
        SearchRecord {
            id: id.to_string(),
            url: url.to_string(),
            delivery_url: url.to_string(),
            pandora_url: None,
            filename: None,
            date: captured,
            year: captured.year(),
            decade: captured.year() / 10,
            site: String::new(),
            host: String::new(),
            host_reversed: String::new(),
            surt: to_surt(url),
            title: None,
            metadata: Vec::new(),
            au_gov: false,
            rule_id,
            policy: Policy::Accepted,
            deliverable: true,
            discoverable: true,
            text_error: false,
            search_category: SearchCategory::Html,
            fulltext: None,
            boost: 1.0,
            last_indexed: date(2020, 1, 1),
        }
    }

    #[tokio::test]
    async fn test_most_specific_rule_reaches_indexed_documents() {
        let h = harness(&[catch_all()], 10).await;
        h.reconciler.run().await.unwrap();

        h.search.insert(indexed("a", "http://trove.nla.gov.au/x", Utc::now(), 1));
        h.search.insert(SearchRecord {
            boost: 0.5,
            ..indexed("b", "http://www.example.com.au/", Utc::now(), 1)
        });
        h.search.insert(indexed("c", "http://example.com/", Utc::now(), 1));

        h.feed.set_rules(records(&[
            catch_all(),
            Rule::builder(2, Policy::RestrictedForBoth, "(au,").build().unwrap(),
            Rule::builder(3, Policy::Accepted, "(au,gov,nla,").build().unwrap(),
        ]));
        let run = h.reconciler.run().await.unwrap();
        assert!(run.is_complete());

        let trove = h.search.get("a").unwrap();
        assert_eq!(trove.rule_id, 3);
        assert_eq!(trove.policy, Policy::Accepted);

        let restricted = h.search.get("b").unwrap();
        assert_eq!(restricted.rule_id, 2);
        assert!(!restricted.deliverable);
        assert!(!restricted.discoverable);
        assert_eq!(restricted.boost, 0.5);

        // Outside the new rules' reach
        let untouched = h.search.get("c").unwrap();
        assert_eq!(untouched.last_indexed, date(2020, 1, 1));
        assert!(!h.reconciler.manager().is_in_recovery().await);
    }

    #[tokio::test]
    async fn test_deleted_rule_moves_documents() {
        let block = Rule::builder(2, Policy::RestrictedForDelivery, "(au,gov,")
            .build()
            .unwrap();
        let h = harness(&[catch_all(), block], 10).await;
        h.reconciler.run().await.unwrap();

        h.search.insert(indexed("a", "http://www.aec.gov.au/", Utc::now(), 2));
        h.feed.set_rules(records(&[catch_all()]));
        h.reconciler.run().await.unwrap();

        let record = h.search.get("a").unwrap();
        assert_eq!(record.rule_id, 1);
        assert!(record.deliverable);
    }

    #[tokio::test]
    async fn test_embargo_releases_and_captures() {
        let embargoed = Rule::builder(2, Policy::RestrictedForBoth, "(au,gov,")
            .embargo_secs(365 * 24 * 3600)
            .build()
            .unwrap();
        let h = harness(&[catch_all(), embargoed], 10).await;
        h.reconciler.run().await.unwrap();

        let recent = Utc::now() - TimeDelta::days(10);
        h.search.insert(indexed("old", "http://www.aec.gov.au/a", date(2015, 3, 1), 2));
        h.search.insert(indexed("new", "http://www.aec.gov.au/b", recent, 1));

        // Rules unchanged: only the date phase has work
        let run = h.reconciler.run().await.unwrap();
        assert!(run.totals.searches >= 2);

        assert_eq!(h.search.get("old").unwrap().rule_id, 1);
        let fresh = h.search.get("new").unwrap();
        assert_eq!(fresh.rule_id, 2);
        assert!(!fresh.discoverable);
    }

    #[tokio::test]
    async fn test_pages_until_exhausted_below_watermark() {
        let h = harness(&[catch_all()], 2).await;
        for i in 0..5 {
            let url = format!("http://a.gov.au/{i}");
            h.search.insert(indexed(&format!("doc-{i}"), &url, Utc::now(), 1));
        }
        let mut later = indexed("late", "http://a.gov.au/late", Utc::now(), 1);
        later.last_indexed = Utc::now() + TimeDelta::days(1);
        h.search.insert(later);

        let run = h.reconciler.run().await.unwrap();
        assert_eq!(run.totals.written, 5);
        assert!(h.search.queries() >= 3);
        assert!(h.search.commits() >= 1);
        assert!(h.search.updates().iter().all(|u| u.id != "late"));
    }

    #[tokio::test]
    async fn test_failed_update_aborts_and_recovers() {
        let h = harness(&[catch_all()], 10).await;
        h.reconciler.run().await.unwrap();
        h.search.insert(indexed("a", "http://www.example.com.au/", Utc::now(), 1));

        let block = Rule::builder(2, Policy::RestrictedForBoth, "(au,").build().unwrap();
        h.feed.set_rules(records(&[catch_all(), block]));
        h.search.set_fail_updates(true);

        let err = h.reconciler.run().await.unwrap_err();
        assert!(matches!(err, AppError::Reconcile(_)));
        let manager = h.reconciler.manager();
        assert!(manager.is_in_recovery().await);
        // The current set stays authoritative after the abort
        assert_eq!(manager.engine().snapshot().len(), 1);
        assert_eq!(h.search.get("a").unwrap().rule_id, 1);

        h.search.set_fail_updates(false);
        h.reconciler.run().await.unwrap();
        assert!(!manager.is_in_recovery().await);
        assert_eq!(h.search.get("a").unwrap().rule_id, 2);
    }

    #[tokio::test]
    async fn test_scheduled_loop_stops() {
        let h = harness(&[catch_all()], 10).await;
        let (tx, rx) = watch::channel(false);
        let reconciler = Arc::new(h.reconciler);
        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.run_scheduled(rx).await })
        };

        // The first start is in recovery, so a run happens right away
        let manager = Arc::clone(reconciler.manager());
        let mut completed = false;
        for _ in 0..200 {
            if !manager.is_in_recovery().await {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(completed);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
