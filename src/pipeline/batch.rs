// src/pipeline/batch.rs

//! Progress of every document of one WARC across the three stages.
//!
//! The tracker never blocks the pipeline: workers only flip per-document
//! stage flags, and [`BatchTracker::recheck`] (driven by the coordinator's
//! ticker) drains whatever finished at the head of each stage queue.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::pipeline::document::{IndexedDocument, Stage, StageResult};
use crate::storage::ErrorRecord;

/// Errors kept per batch; anything beyond is only counted.
pub const ERROR_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledError {
    pub doc_id: String,
    pub stage: String,
    pub message: String,
}

/// Dashboard view of a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub warc_id: u64,
    pub started: DateTime<Utc>,
    pub estimate: u64,
    pub load_complete: bool,
    pub load_failed: bool,
    pub retrieved: bool,
    pub documents: u64,
    pub bytes: u64,
    pub filtered: u64,
    pub transformed: u64,
    pub indexed: u64,
    pub pending: [usize; 3],
    pub errors: Vec<String>,
    pub discarded_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked_error: Option<ErrorRecord>,
}

#[derive(Debug, Default)]
struct BatchState {
    queues: [VecDeque<Arc<IndexedDocument>>; 3],
    completed: [u64; 3],
    sample: Vec<SampledError>,
    sampled_ids: HashSet<String>,
    discarded: u64,
    documents: u64,
    bytes: u64,
    load_complete: bool,
    load_failed: bool,
    load_error: Option<String>,
    retrieved: bool,
    tracked_error: Option<ErrorRecord>,
    finished_clean: bool,
}

impl BatchState {
    fn load_finished(&self) -> bool {
        self.load_complete || self.load_failed
    }

    fn stage_complete(&self, stage: Stage) -> bool {
        self.load_finished() && self.queues[stage.index()].is_empty()
    }

    fn all_complete(&self) -> bool {
        Stage::ALL.iter().all(|s| self.stage_complete(*s))
    }

    fn sample_error(&mut self, doc_id: &str, stage: &str, message: String) {
        if self.sampled_ids.contains(doc_id) {
            return;
        }
        if self.sample.len() >= ERROR_SAMPLE_LIMIT {
            self.discarded += 1;
            return;
        }
        self.sampled_ids.insert(doc_id.to_string());
        self.sample.push(SampledError {
            doc_id: doc_id.to_string(),
            stage: stage.to_string(),
            message,
        });
    }
}

#[derive(Debug)]
pub struct BatchTracker {
    warc_id: u64,
    estimate: u64,
    started: DateTime<Utc>,
    state: Mutex<BatchState>,
}

impl BatchTracker {
    pub fn new(warc_id: u64, estimate: u64) -> Self {
        Self {
            warc_id,
            estimate,
            started: Utc::now(),
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn warc_id(&self) -> u64 {
        self.warc_id
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a document in all three stage queues.
    pub fn add(&self, doc: Arc<IndexedDocument>) -> Result<()> {
        let mut state = self.state();
        if state.load_finished() {
            return Err(AppError::validation(format!(
                "batch {} already finished loading, cannot add {}",
                self.warc_id,
                doc.id()
            )));
        }
        state.documents += 1;
        state.bytes += doc.content_length();
        for queue in &mut state.queues {
            queue.push_back(Arc::clone(&doc));
        }
        Ok(())
    }

    /// Count a document that could not enter the pipeline as an error.
    pub fn reject(&self, doc_id: &str, error: &AppError) {
        self.state().sample_error(doc_id, "load", error.to_string());
    }

    pub fn load_complete(&self) {
        self.state().load_complete = true;
    }

    pub fn load_failed(&self, error: &AppError) {
        let mut state = self.state();
        state.load_failed = true;
        state.load_error = Some(error.to_string());
    }

    pub fn mark_retrieved(&self) {
        self.state().retrieved = true;
    }

    pub fn is_retrieved(&self) -> bool {
        self.state().retrieved
    }

    pub fn is_load_failed(&self) -> bool {
        self.state().load_failed
    }

    /// Drain finished documents off the head of each stage queue.
    pub fn recheck(&self) {
        let mut state = self.state();
        for stage in Stage::ALL {
            loop {
                let Some(head) = state.queues[stage.index()].front() else {
                    break;
                };
                let Some(result) = head.result(stage) else {
                    break;
                };
                let doc_id = head.id().to_string();
                state.queues[stage.index()].pop_front();
                match result {
                    StageResult::Succeeded => state.completed[stage.index()] += 1,
                    StageResult::Failed(message) => {
                        state.sample_error(&doc_id, stage.as_str(), message)
                    }
                    StageResult::Skipped => {}
                }
            }
        }

        if state.all_complete() && state.sample.is_empty() && state.discarded == 0 && !state.load_failed
        {
            state.finished_clean = true;
        }
    }

    pub fn is_stage_complete(&self, stage: Stage) -> bool {
        self.state().stage_complete(stage)
    }

    pub fn is_filter_complete(&self) -> bool {
        self.is_stage_complete(Stage::Filter)
    }

    pub fn is_transform_complete(&self) -> bool {
        self.is_stage_complete(Stage::Transform)
    }

    pub fn is_index_complete(&self) -> bool {
        self.is_stage_complete(Stage::Index)
    }

    /// All stages drained after the load finished, with or without errors.
    pub fn is_finished(&self) -> bool {
        self.state().all_complete()
    }

    /// Complete, no sampled or discarded errors, and the load succeeded.
    ///
    /// Once true it stays true.
    pub fn finished_without_error(&self) -> bool {
        self.state().finished_clean
    }

    pub fn has_errors(&self) -> bool {
        let state = self.state();
        !state.sample.is_empty() || state.discarded > 0 || state.load_failed
    }

    pub fn error_sample(&self) -> Vec<SampledError> {
        self.state().sample.clone()
    }

    pub fn discarded_errors(&self) -> u64 {
        self.state().discarded
    }

    pub fn completed(&self, stage: Stage) -> u64 {
        self.state().completed[stage.index()]
    }

    pub fn document_count(&self) -> u64 {
        self.state().documents
    }

    /// Still in progress after `limit`.
    pub fn is_stale(&self, limit: Duration) -> bool {
        if self.is_finished() {
            return false;
        }
        let age = Utc::now() - self.started;
        age.to_std().is_ok_and(|age| age > limit)
    }

    pub fn set_tracked_error(&self, record: ErrorRecord) {
        self.state().tracked_error = Some(record);
    }

    pub fn tracked_error(&self) -> Option<ErrorRecord> {
        self.state().tracked_error.clone()
    }

    /// Release the queued documents, keeping the counters for the summary.
    pub fn mothball(&self) {
        let mut state = self.state();
        for queue in &mut state.queues {
            queue.clear();
            queue.shrink_to_fit();
        }
    }

    pub fn summary(&self) -> BatchSummary {
        let state = self.state();
        let mut errors: Vec<String> = state
            .sample
            .iter()
            .map(|e| format!("{} [{}]: {}", e.doc_id, e.stage, e.message))
            .collect();
        if let Some(load_error) = &state.load_error {
            errors.insert(0, format!("load: {load_error}"));
        }
        BatchSummary {
            warc_id: self.warc_id,
            started: self.started,
            estimate: self.estimate,
            load_complete: state.load_complete,
            load_failed: state.load_failed,
            retrieved: state.retrieved,
            documents: state.documents,
            bytes: state.bytes,
            filtered: state.completed[Stage::Filter.index()],
            transformed: state.completed[Stage::Transform.index()],
            indexed: state.completed[Stage::Index.index()],
            pending: [
                state.queues[0].len(),
                state.queues[1].len(),
                state.queues[2].len(),
            ],
            errors,
            discarded_errors: state.discarded,
            tracked_error: state.tracked_error.clone(),
        }
    }
}
