// src/pipeline/coordinator.rs

//! Control loop that feeds WARCs into the stage pipeline.
//!
//! A coordinator runs three kinds of tasks:
//!
//! - **read workers** fetch the documents of a pending WARC and submit
//!   them to the pipeline, registering a [`BatchTracker`] per WARC;
//! - the **acquisition loop** asks the [`BatchSource`] for more WARCs once
//!   the pending queue is drained and the tracking map has room;
//! - a single **ticker** rechecks every tracked batch, retries or
//!   quarantines failed WARCs and advances the checkpoint over the longest
//!   resolved prefix of the submission order.
//!
//! The full reindex and the periodic sync are the same coordinator with a
//! different [`BatchSource`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{CoordinatorConfig, RetryConfig, WarcToIndex};
use crate::pipeline::batch::{BatchSummary, BatchTracker};
use crate::pipeline::document::{IndexedDocument, Stage};
use crate::pipeline::source::BatchSource;
use crate::pipeline::stages::StagePipeline;
use crate::pipeline::window::TimeWindow;
use crate::services::ArchiveSource;
use crate::storage::{CheckpointStore, ErrorRecord};

/// Local wall clock, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub name: String,
    pub state: CoordinatorState,
    pub paused: bool,
    pub pending: usize,
    pub tracked: usize,
    pub awaiting_retry: usize,
    pub completed: u64,
    pub retried: u64,
    pub quarantined: u64,
    pub batches: Vec<BatchSummary>,
}

#[derive(Debug, Clone)]
struct Settings {
    read_workers: usize,
    queue_limit: usize,
    tick: Duration,
    stale_after: Duration,
    stale_warning: Duration,
    idle_poll: Duration,
    max_retries: u32,
    backoff: Duration,
    io_pause: Duration,
    fatal_pause: Duration,
    window: Option<TimeWindow>,
    window_recheck: Duration,
}

#[derive(Debug, Clone)]
struct PendingWarc {
    warc: WarcToIndex,
    bypass_cache: bool,
    error: Option<ErrorRecord>,
}

#[derive(Debug)]
struct DueRetry {
    due: Instant,
    pending: PendingWarc,
}

#[derive(Debug, Default)]
struct Tracking {
    pending: VecDeque<PendingWarc>,
    batches: BTreeMap<u64, Arc<BatchTracker>>,
    /// Submission order of WARCs whose progress is not yet persisted
    order: VecDeque<WarcToIndex>,
    resolved: HashSet<u64>,
    retries: Vec<DueRetry>,
    stale_warned: HashMap<u64, Instant>,
    unpersisted: Option<WarcToIndex>,
}

enum Verdict {
    Healthy,
    Errored,
    InProgress,
}

pub struct ReindexCoordinator {
    source: Arc<dyn BatchSource>,
    archive: Arc<dyn ArchiveSource>,
    store: Arc<dyn CheckpointStore>,
    pipeline: Arc<StagePipeline>,
    settings: Settings,
    clock: Clock,
    state: Mutex<CoordinatorState>,
    tracking: Mutex<Tracking>,
    stop_tx: watch::Sender<bool>,
    paused: AtomicBool,
    acquisition_done: AtomicBool,
    completed: AtomicU64,
    retried: AtomicU64,
    quarantined: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReindexCoordinator {
    pub fn new(
        source: Arc<dyn BatchSource>,
        archive: Arc<dyn ArchiveSource>,
        store: Arc<dyn CheckpointStore>,
        pipeline: Arc<StagePipeline>,
        config: &CoordinatorConfig,
        retry: &RetryConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            source,
            archive,
            store,
            pipeline,
            settings: Settings {
                read_workers: config.read_workers,
                queue_limit: config.queue_limit,
                tick: Duration::from_millis(config.tick_ms),
                stale_after: Duration::from_secs(config.stale_after_secs),
                stale_warning: Duration::from_secs(config.stale_warning_secs),
                idle_poll: Duration::from_secs(config.idle_poll_secs),
                max_retries: retry.max_retries,
                backoff: Duration::from_secs(retry.backoff_secs),
                io_pause: Duration::from_secs(retry.io_pause_secs),
                fatal_pause: Duration::from_secs(retry.fatal_pause_secs),
                window: None,
                window_recheck: Duration::from_secs(60),
            },
            clock: Arc::new(|| Local::now().naive_local()),
            state: Mutex::new(CoordinatorState::Idle),
            tracking: Mutex::new(Tracking::default()),
            stop_tx,
            paused: AtomicBool::new(false),
            acquisition_done: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Only acquire new WARCs while the local time is inside `window`.
    pub fn with_window(mut self, window: TimeWindow, recheck: Duration) -> Self {
        self.settings.window = Some(window);
        self.settings.window_recheck = recheck;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Begin indexing. Old errors of this coordinator's domain that are
    /// not quarantined come back as retries due immediately.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() != CoordinatorState::Idle {
            return Err(AppError::validation(format!(
                "coordinator '{}' is already running",
                self.name()
            )));
        }
        self.join_handles().await;

        let old_errors = self.store.old_errors(self.source.domain()).await?;
        {
            let mut tracking = self.tracking();
            *tracking = Tracking::default();
            let now = Instant::now();
            let retryable = old_errors
                .into_iter()
                .filter(|r| r.retries < self.settings.max_retries);
            for record in retryable {
                tracking.retries.push(DueRetry {
                    due: now,
                    pending: PendingWarc {
                        warc: WarcToIndex::new(record.warc_id, 0),
                        bypass_cache: true,
                        error: Some(record),
                    },
                });
            }
            if !tracking.retries.is_empty() {
                log::info!(
                    "[{}] Reloaded {} failed WARCs for retry",
                    self.name(),
                    tracking.retries.len()
                );
            }
        }

        self.acquisition_done.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.stop_tx.send_replace(false);
        self.set_state(CoordinatorState::Running);

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..self.settings.read_workers {
            handles.push(tokio::spawn(Arc::clone(self).read_worker()));
        }
        handles.push(tokio::spawn(Arc::clone(self).acquisition_loop()));
        handles.push(tokio::spawn(Arc::clone(self).ticker()));

        log::info!(
            "[{}] Coordinator started with {} read workers",
            self.name(),
            self.settings.read_workers
        );
        Ok(())
    }

    /// Stop acquiring and reading, wait for the tasks, and go idle.
    ///
    /// Documents already submitted to the pipeline still drain.
    pub async fn stop(&self) {
        if self.state() == CoordinatorState::Idle {
            self.join_handles().await;
            return;
        }
        self.set_state(CoordinatorState::Stopping);
        self.stop_tx.send_replace(true);
        self.join_handles().await;
        self.set_state(CoordinatorState::Idle);
        log::info!("[{}] Coordinator stopped", self.name());
    }

    /// Resolve once the coordinator has gone idle on its own or was stopped.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
        self.join_handles().await;
    }

    async fn join_handles(&self) {
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::warn!("[{}] Task ended abnormally: {}", self.name(), e);
            }
        }
    }

    fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Sleep for `duration` unless stopped first; true when stopped.
    async fn pause(&self, duration: Duration) -> bool {
        let mut rx = self.stop_tx.subscribe();
        tokio::select! {
            _ = rx.wait_for(|stopped| *stopped) => true,
            _ = tokio::time::sleep(duration) => self.is_stopping(),
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        let tracking = self.tracking();
        CoordinatorStatus {
            name: self.name().to_string(),
            state: self.state(),
            paused: self.is_paused(),
            pending: tracking.pending.len(),
            tracked: tracking.batches.len(),
            awaiting_retry: tracking.retries.len(),
            completed: self.completed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            quarantined: self.quarantined.load(Ordering::SeqCst),
            batches: tracking.batches.values().map(|b| b.summary()).collect(),
        }
    }

    async fn read_worker(self: Arc<Self>) {
        while !self.is_stopping() {
            let next = self.claim_pending();
            let Some((job, batch)) = next else {
                if self.pause(self.settings.tick).await {
                    break;
                }
                continue;
            };
            // Failures stay on the batch for the ticker to resolve
            let _ = self.load_warc(&job, &batch, None).await;
        }
    }

    /// Move the next pending WARC into the tracking map in one step.
    fn claim_pending(&self) -> Option<(PendingWarc, Arc<BatchTracker>)> {
        let mut tracking = self.tracking();
        let job = tracking.pending.pop_front()?;
        let batch = Arc::new(BatchTracker::new(job.warc.id, job.warc.url_count));
        if let Some(record) = &job.error {
            batch.set_tracked_error(record.clone());
        }
        tracking.batches.insert(job.warc.id, Arc::clone(&batch));
        Some((job, batch))
    }

    /// Fetch a WARC and submit its documents, or only the one at `offset`.
    ///
    /// Load failures and rejected documents are recorded on `batch`.
    async fn load_warc(
        &self,
        job: &PendingWarc,
        batch: &BatchTracker,
        offset: Option<i64>,
    ) -> Result<Vec<Arc<IndexedDocument>>> {
        let warc_id = job.warc.id;
        let documents = match self.archive.fetch_documents(warc_id, job.bypass_cache).await {
            Ok(documents) => documents,
            Err(e) => {
                log::warn!("[{}] Loading WARC {} failed: {}", self.name(), warc_id, e);
                batch.load_failed(&e);
                batch.mark_retrieved();
                return Err(e);
            }
        };

        let mut submitted = Vec::new();
        for (index, document) in documents.into_iter().enumerate() {
            if offset.is_some_and(|o| o != document.warc_offset) {
                continue;
            }
            match IndexedDocument::new(warc_id, document) {
                Ok(doc) => {
                    let doc = Arc::new(doc);
                    if let Err(e) = batch.add(Arc::clone(&doc)) {
                        log::warn!("[{}] {}", self.name(), e);
                        continue;
                    }
                    self.pipeline.submit(Arc::clone(&doc));
                    submitted.push(doc);
                }
                Err(e) => {
                    log::warn!("[{}] WARC {}: {}", self.name(), warc_id, e);
                    batch.reject(&format!("{warc_id}/#{index}"), &e);
                }
            }
        }
        batch.load_complete();
        batch.mark_retrieved();
        log::debug!(
            "[{}] WARC {} loaded with {} documents",
            self.name(),
            warc_id,
            batch.document_count()
        );
        Ok(submitted)
    }

    /// Index one WARC on demand, bypassing the archive cache, and wait
    /// until its documents have left every stage.
    ///
    /// With `offset` only that document is indexed, and its failure in
    /// any stage comes back as the error. Needs a started pipeline but
    /// not a running coordinator.
    pub async fn index_one(
        &self,
        warc_id: u64,
        offset: Option<i64>,
    ) -> Result<Vec<Arc<IndexedDocument>>> {
        let job = PendingWarc {
            warc: WarcToIndex::new(warc_id, 0),
            bypass_cache: true,
            error: None,
        };
        let batch = BatchTracker::new(warc_id, 0);
        let documents = {
            let _gate = self.pipeline.rule_gate().read().await;
            self.load_warc(&job, &batch, offset).await?
        };

        loop {
            batch.recheck();
            if batch.is_finished() {
                break;
            }
            tokio::time::sleep(self.settings.tick).await;
        }
        log::info!(
            "[{}] WARC {} indexed on demand: {} documents, {} errors",
            self.name(),
            warc_id,
            documents.len(),
            batch.error_sample().len() as u64 + batch.discarded_errors()
        );

        let Some(offset) = offset else {
            return Ok(documents);
        };
        if let Some(rejected) = batch.error_sample().into_iter().next() {
            return Err(AppError::stage(rejected.doc_id, rejected.stage, rejected.message));
        }
        let Some(doc) = documents.first() else {
            return Err(AppError::validation(format!(
                "WARC {warc_id} has no document at offset {offset}"
            )));
        };
        for stage in Stage::ALL {
            if let Some(message) = doc.error(stage) {
                return Err(AppError::stage(doc.id(), stage, message));
            }
        }
        Ok(documents)
    }

    async fn acquisition_loop(self: Arc<Self>) {
        loop {
            if self.is_stopping() {
                break;
            }

            if let Some(window) = &self.settings.window {
                let now = (self.clock)();
                if !window.contains(now.time()) {
                    if !self.paused.swap(true, Ordering::SeqCst) {
                        log::info!("[{}] Outside the run window, pausing", self.name());
                    }
                    if self.pause(self.settings.window_recheck).await {
                        break;
                    }
                    continue;
                }
                if self.paused.swap(false, Ordering::SeqCst) {
                    log::info!("[{}] Run window open, resuming", self.name());
                }
            }

            let saturated = {
                let tracking = self.tracking();
                !tracking.pending.is_empty()
                    || tracking.pending.len() + tracking.batches.len() >= self.settings.queue_limit
            };
            if saturated {
                if self.pause(self.settings.tick).await {
                    break;
                }
                continue;
            }

            let batch = {
                let _gate = self.pipeline.rule_gate().read().await;
                self.source.next_batch().await
            };

            match batch {
                Ok(batch) if batch.is_empty() => {
                    if self.source.finishes_when_exhausted() {
                        log::info!("[{}] No more WARCs to acquire", self.name());
                        self.acquisition_done.store(true, Ordering::SeqCst);
                        break;
                    }
                    if self.pause(self.settings.idle_poll).await {
                        break;
                    }
                }
                Ok(batch) => self.enqueue(batch),
                Err(e) => {
                    let wait = if e.is_transient() {
                        self.settings.io_pause
                    } else {
                        self.settings.fatal_pause
                    };
                    if e.is_fatal() {
                        log::error!(
                            "[{}] Rules unusable, pausing acquisition {:?}: {}",
                            self.name(),
                            wait,
                            e
                        );
                    } else {
                        log::warn!(
                            "[{}] Acquiring WARCs failed, pausing {:?}: {}",
                            self.name(),
                            wait,
                            e
                        );
                    }
                    if self.pause(wait).await {
                        break;
                    }
                }
            }
        }
    }

    fn enqueue(&self, batch: Vec<WarcToIndex>) {
        let mut tracking = self.tracking();
        let mut added = 0;
        for warc in batch {
            let known = tracking.batches.contains_key(&warc.id)
                || tracking.order.iter().any(|w| w.id == warc.id);
            if known {
                log::debug!("[{}] WARC {} already in progress", self.name(), warc.id);
                continue;
            }
            tracking.order.push_back(warc.clone());
            tracking.pending.push_back(PendingWarc {
                warc,
                bypass_cache: false,
                error: None,
            });
            added += 1;
        }
        log::info!("[{}] Acquired {} WARCs", self.name(), added);
    }

    async fn ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = rx.wait_for(|stopped| *stopped) => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
            if self.is_finished() {
                log::info!("[{}] All WARCs indexed, going idle", self.name());
                self.stop_tx.send_replace(true);
                self.set_state(CoordinatorState::Idle);
                break;
            }
        }
    }

    fn is_finished(&self) -> bool {
        if !self.acquisition_done.load(Ordering::SeqCst) {
            return false;
        }
        let tracking = self.tracking();
        tracking.pending.is_empty() && tracking.batches.is_empty() && tracking.retries.is_empty()
    }

    /// One pass: classify tracked batches, queue due retries, advance the
    /// checkpoint.
    async fn tick(&self) {
        let batches: Vec<Arc<BatchTracker>> = self.tracking().batches.values().cloned().collect();
        for batch in batches {
            batch.recheck();
            let verdict = if batch.finished_without_error() {
                Verdict::Healthy
            } else if batch.is_retrieved() && batch.is_finished() {
                Verdict::Errored
            } else {
                Verdict::InProgress
            };

            match verdict {
                Verdict::Healthy => self.resolve_healthy(&batch).await,
                Verdict::Errored => self.resolve_errored(&batch).await,
                Verdict::InProgress => self.warn_if_stale(&batch),
            }
        }

        self.queue_due_retries();
        self.advance_checkpoint().await;
    }

    async fn resolve_healthy(&self, batch: &BatchTracker) {
        let warc_id = batch.warc_id();
        if batch.tracked_error().is_some() {
            if let Err(e) = self.store.remove_error(warc_id).await {
                log::warn!("[{}] Clearing error of WARC {} failed: {}", self.name(), warc_id, e);
                return;
            }
            log::info!("[{}] WARC {} recovered", self.name(), warc_id);
        }
        batch.mothball();
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.resolve(warc_id);
    }

    async fn resolve_errored(&self, batch: &BatchTracker) {
        let warc_id = batch.warc_id();
        let record = match self.store.track_error(warc_id, self.source.domain()).await {
            Ok(record) => record,
            Err(e) => {
                log::warn!("[{}] Tracking error of WARC {} failed: {}", self.name(), warc_id, e);
                return;
            }
        };
        batch.set_tracked_error(record.clone());
        let summary = batch.summary();
        batch.mothball();

        if record.retries < self.settings.max_retries {
            log::warn!(
                "[{}] WARC {} finished with errors (attempt {}), retrying in {:?}: {:?}",
                self.name(),
                warc_id,
                record.retries + 1,
                self.settings.backoff,
                summary.errors
            );
            self.retried.fetch_add(1, Ordering::SeqCst);
            self.tracking().retries.push(DueRetry {
                due: Instant::now() + self.settings.backoff,
                pending: PendingWarc {
                    warc: WarcToIndex::new(warc_id, summary.estimate),
                    bypass_cache: true,
                    error: Some(record),
                },
            });
        } else {
            log::error!(
                "[{}] WARC {} quarantined after {} retries: {:?}",
                self.name(),
                warc_id,
                record.retries,
                summary.errors
            );
            self.quarantined.fetch_add(1, Ordering::SeqCst);
        }
        self.resolve(warc_id);
    }

    fn resolve(&self, warc_id: u64) {
        let mut tracking = self.tracking();
        tracking.batches.remove(&warc_id);
        tracking.stale_warned.remove(&warc_id);
        if tracking.order.iter().any(|w| w.id == warc_id) {
            tracking.resolved.insert(warc_id);
        }
    }

    fn warn_if_stale(&self, batch: &BatchTracker) {
        if !batch.is_stale(self.settings.stale_after) {
            return;
        }
        let mut tracking = self.tracking();
        let now = Instant::now();
        let due = tracking
            .stale_warned
            .get(&batch.warc_id())
            .is_none_or(|last| now.duration_since(*last) >= self.settings.stale_warning);
        if due {
            tracking.stale_warned.insert(batch.warc_id(), now);
            log::warn!(
                "[{}] WARC {} still in progress since {}: {:?}",
                self.name(),
                batch.warc_id(),
                batch.started(),
                batch.summary().pending
            );
        }
    }

    fn queue_due_retries(&self) {
        let mut tracking = self.tracking();
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            tracking.retries.drain(..).partition(|r| r.due <= now);
        tracking.retries = waiting;
        for retry in due {
            log::info!("[{}] Retrying WARC {}", self.name(), retry.pending.warc.id);
            tracking.pending.push_back(retry.pending);
        }
    }

    async fn advance_checkpoint(&self) {
        let target = {
            let mut tracking = self.tracking();
            while let Some(front) = tracking.order.front() {
                let id = front.id;
                if !tracking.resolved.remove(&id) {
                    break;
                }
                tracking.unpersisted = tracking.order.pop_front();
            }
            tracking.unpersisted.clone()
        };

        let Some(item) = target else {
            return;
        };
        match self.source.persist_progress(&item).await {
            Ok(()) => {
                let mut tracking = self.tracking();
                if tracking.unpersisted.as_ref().is_some_and(|w| w.id == item.id) {
                    tracking.unpersisted = None;
                }
            }
            Err(e) => log::warn!(
                "[{}] Persisting progress at WARC {} failed: {}",
                self.name(),
                item.id,
                e
            ),
        }
    }
}
