// src/pipeline/stages.rs

//! The shared filter, transform and index worker pools.
//!
//! One [`StagePipeline`] is created per process and handed to every
//! coordinator and to the reconciler. Each stage has a FIFO queue and a
//! fixed number of tokio workers polling it. A stage error, or a panic in
//! the stage body, is attached to the document and the worker moves on.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::PipelineConfig;
use crate::pipeline::document::{IndexedDocument, Stage};
use crate::pipeline::filter::{QualityControl, apply_filter};
use crate::pipeline::transform::RecordBuilder;
use crate::restrictions::RestrictionEngine;
use crate::services::{SearchEngine, SearchRecord};

#[derive(Debug, Default)]
struct StageQueue {
    jobs: Mutex<VecDeque<Arc<IndexedDocument>>>,
}

impl StageQueue {
    fn push(&self, doc: Arc<IndexedDocument>) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(doc);
    }

    fn pop(&self) -> Option<Arc<IndexedDocument>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Queue depths for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub filter: usize,
    pub transform: usize,
    pub index: usize,
    pub pending_writes: usize,
    /// Documents submitted and not yet through the index stage
    pub in_flight: usize,
}

pub struct StagePipeline {
    engine: Arc<RestrictionEngine>,
    search: Arc<dyn SearchEngine>,
    quality: QualityControl,
    builder: RecordBuilder,
    config: PipelineConfig,
    queues: [StageQueue; 3],
    in_flight: AtomicUsize,
    write_permits: Arc<Semaphore>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rule_gate: RwLock<()>,
}

impl StagePipeline {
    pub fn new(
        engine: Arc<RestrictionEngine>,
        search: Arc<dyn SearchEngine>,
        config: &PipelineConfig,
        pandora_collection_id: u64,
    ) -> Self {
        Self {
            engine,
            search,
            quality: QualityControl::new(config, pandora_collection_id),
            builder: RecordBuilder::new(config),
            config: config.clone(),
            queues: Default::default(),
            in_flight: AtomicUsize::new(0),
            write_permits: Arc::new(Semaphore::new(config.max_pending_writes)),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            rule_gate: RwLock::new(()),
        }
    }

    /// Spawn the worker pools.
    pub fn start(self: &Arc<Self>) {
        let pools = [
            (Stage::Filter, self.config.filter_workers),
            (Stage::Transform, self.config.transform_workers),
            (Stage::Index, self.config.index_workers),
        ];

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for (stage, count) in pools {
            for _ in 0..count {
                let pipeline = Arc::clone(self);
                workers.push(tokio::spawn(pipeline.run_worker(stage)));
            }
        }
        log::info!(
            "Stage pipeline started: {} filter, {} transform, {} index workers",
            self.config.filter_workers,
            self.config.transform_workers,
            self.config.index_workers
        );
    }

    pub fn engine(&self) -> &Arc<RestrictionEngine> {
        &self.engine
    }

    /// Gate held shared while coordinators acquire batches and exclusively
    /// by a reconciliation run.
    pub fn rule_gate(&self) -> &RwLock<()> {
        &self.rule_gate
    }

    /// Queue a document for filtering.
    pub fn submit(&self, doc: Arc<IndexedDocument>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.queues[Stage::Filter.index()].push(doc);
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            filter: self.queues[0].len(),
            transform: self.queues[1].len(),
            index: self.queues[2].len(),
            pending_writes: self.config.max_pending_writes - self.write_permits.available_permits(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    pub async fn wait_until_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Stop the workers once their current job is done.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("Stage worker ended abnormally: {}", e);
            }
        }
        log::info!("Stage pipeline stopped");
    }

    async fn run_worker(self: Arc<Self>, stage: Stage) {
        let poll = self.config.poll_interval();
        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(doc) = self.queues[stage.index()].pop() else {
                tokio::time::sleep(poll).await;
                continue;
            };
            match stage {
                Stage::Filter => self.filter(doc),
                Stage::Transform => self.transform(doc),
                Stage::Index => self.index(doc).await,
            }
        }
    }

    fn filter(&self, doc: Arc<IndexedDocument>) {
        let result = guarded(|| {
            doc.start(Stage::Filter)?;
            let outcome = apply_filter(&self.quality, &self.engine, doc.document())?;
            doc.set_outcome(outcome);
            doc.finish(Stage::Filter)
        });
        match result {
            Ok(()) => self.queues[Stage::Transform.index()].push(doc),
            Err(message) => self.fail(&doc, Stage::Filter, message),
        }
    }

    fn transform(&self, doc: Arc<IndexedDocument>) {
        let result = guarded(|| {
            doc.start(Stage::Transform)?;
            let outcome = doc.outcome().ok_or_else(|| {
                AppError::stage(doc.id(), Stage::Transform, "no filter outcome")
            })?;
            let record = self
                .builder
                .build(doc.id(), doc.document(), &outcome, Utc::now())?;
            doc.set_record(record);
            doc.finish(Stage::Transform)
        });
        match result {
            Ok(()) => self.queues[Stage::Index.index()].push(doc),
            Err(message) => self.fail(&doc, Stage::Transform, message),
        }
    }

    async fn index(self: &Arc<Self>, doc: Arc<IndexedDocument>) {
        if let Err(e) = doc.start(Stage::Index) {
            self.fail(&doc, Stage::Index, e.to_string());
            return;
        }
        let Some(record) = doc.record() else {
            self.complete(&doc);
            return;
        };

        if !self.config.async_writes {
            self.write(&doc, &record).await;
            return;
        }

        let permit = match Arc::clone(&self.write_permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                self.fail(&doc, Stage::Index, e.to_string());
                return;
            }
        };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.write(&doc, &record).await;
            drop(permit);
        });
    }

    async fn write(&self, doc: &IndexedDocument, record: &SearchRecord) {
        let result = AssertUnwindSafe(self.search.upsert(record))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => self.complete(doc),
            Ok(Err(e)) => self.fail(doc, Stage::Index, e.to_string()),
            Err(panic) => self.fail(doc, Stage::Index, panic_message(panic)),
        }
    }

    fn complete(&self, doc: &IndexedDocument) {
        if let Err(e) = doc.finish(Stage::Index) {
            self.fail(doc, Stage::Index, e.to_string());
            return;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn fail(&self, doc: &IndexedDocument, stage: Stage, message: String) {
        log::warn!("{}", AppError::stage(doc.id(), stage, &message));
        doc.fail(stage, message);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run a stage body, turning errors and panics into a message.
fn guarded(body: impl FnOnce() -> Result<()>) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{Policy, Rule};
    use crate::pipeline::batch::BatchTracker;
    use crate::restrictions::RuleSet;
    use crate::testing::{MemorySearch, document, wait_for};

    fn pipeline(search: Arc<MemorySearch>, async_writes: bool) -> Arc<StagePipeline> {
        let rules = RuleSet::build(vec![
            Rule::builder(1, Policy::Accepted, "(").build().unwrap(),
            Rule::builder(2, Policy::RestrictedForBoth, "(com,blocked,")
                .build()
                .unwrap(),
        ])
        .unwrap();
        let config = PipelineConfig {
            poll_interval_ms: 5,
            async_writes,
            max_pending_writes: 2,
            ..PipelineConfig::default()
        };
        let pipeline = Arc::new(StagePipeline::new(
            Arc::new(RestrictionEngine::new(rules)),
            search,
            &config,
            4,
        ));
        pipeline.start();
        pipeline
    }

    fn load(pipeline: &StagePipeline, batch: &BatchTracker, urls: &[&str]) {
        for (offset, url) in urls.iter().enumerate() {
            let doc = Arc::new(
                IndexedDocument::new(batch.warc_id(), document(url, offset as i64)).unwrap(),
            );
            batch.add(Arc::clone(&doc)).unwrap();
            pipeline.submit(doc);
        }
        batch.load_complete();
    }

    #[tokio::test]
    async fn test_documents_flow_through_all_stages() {
        let search = Arc::new(MemorySearch::new());
        let pipeline = pipeline(Arc::clone(&search), true);
        let batch = BatchTracker::new(5, 3);
        load(
            &pipeline,
            &batch,
            &[
                "http://example.com/a",
                "http://example.com/b",
                "http://blocked.com/c",
            ],
        );

        assert!(wait_for(Duration::from_secs(5), || pipeline.is_idle()).await);
        batch.recheck();

        assert!(batch.finished_without_error());
        assert_eq!(search.len(), 3);
        let blocked = search.get("5/2").unwrap();
        assert_eq!(blocked.rule_id, 2);
        assert!(!blocked.discoverable);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_stage_errors_are_attached_to_documents() {
        let search = Arc::new(MemorySearch::new());
        search.fail_id("8/1");
        let pipeline = pipeline(Arc::clone(&search), false);
        let batch = BatchTracker::new(8, 3);

        let mut no_delivery = document("http://example.com/x", 0);
        no_delivery.delivery_url = None;
        let doc = Arc::new(IndexedDocument::new(8, no_delivery).unwrap());
        batch.add(Arc::clone(&doc)).unwrap();
        pipeline.submit(doc);
        load_more(&pipeline, &batch);

        assert!(wait_for(Duration::from_secs(5), || pipeline.is_idle()).await);
        batch.recheck();

        assert!(batch.is_finished());
        assert!(!batch.finished_without_error());
        let sample = batch.error_sample();
        assert_eq!(sample.len(), 2);
        assert_eq!(sample[0].stage, "transform");
        assert_eq!(sample[1].stage, "index");
        assert_eq!(batch.completed(Stage::Index), 1);
        pipeline.shutdown().await;
    }

    fn load_more(pipeline: &StagePipeline, batch: &BatchTracker) {
        for offset in [1, 2] {
            let doc = Arc::new(
                IndexedDocument::new(8, document("http://example.com/y", offset)).unwrap(),
            );
            batch.add(Arc::clone(&doc)).unwrap();
            pipeline.submit(doc);
        }
        batch.load_complete();
    }

    #[tokio::test]
    async fn test_lockdown_fails_filter_stage() {
        let search = Arc::new(MemorySearch::new());
        let pipeline = pipeline(Arc::clone(&search), true);
        pipeline.engine().lock_down("test");
        let batch = BatchTracker::new(2, 1);
        load(&pipeline, &batch, &["http://example.com/a"]);

        assert!(wait_for(Duration::from_secs(5), || pipeline.is_idle()).await);
        batch.recheck();

        assert_eq!(batch.error_sample()[0].stage, "filter");
        assert_eq!(search.len(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_rule_gate_is_exclusive() {
        let search = Arc::new(MemorySearch::new());
        let pipeline = pipeline(search, true);
        let exclusive = pipeline.rule_gate().write().await;
        assert!(pipeline.rule_gate().try_read().is_err());
        drop(exclusive);
        assert!(pipeline.rule_gate().try_read().is_ok());
        pipeline.shutdown().await;
    }

    #[test]
    fn test_guarded_catches_panics() {
        let result = guarded(|| panic!("boom"));
        assert_eq!(result, Err("panicked: boom".to_string()));
        let result = guarded(|| Err(AppError::validation("bad")));
        assert!(result.unwrap_err().contains("bad"));
    }
}
