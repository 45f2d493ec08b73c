// src/pipeline/document.rs

//! A document travelling through the stage pipeline.
//!
//! Each stage has a tracker that moves `NotStarted -> Started -> Finished`
//! exactly once. A failure finishes the failing stage with its error and
//! finishes every later stage as skipped, so batch accounting sees the
//! document once.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{AppError, Result};
use crate::models::{ContentThreshold, Document};
use crate::pipeline::filter::FilterOutcome;
use crate::services::SearchRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Filter,
    Transform,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Filter, Stage::Transform, Stage::Index];

    pub fn index(self) -> usize {
        match self {
            Stage::Filter => 0,
            Stage::Transform => 1,
            Stage::Index => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Filter => "filter",
            Stage::Transform => "transform",
            Stage::Index => "index",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Progress {
    #[default]
    NotStarted,
    Started,
    Finished,
}

#[derive(Debug, Default)]
struct StageState {
    progress: Progress,
    error: Option<String>,
    skipped: bool,
}

#[derive(Debug, Default)]
struct DocumentState {
    stages: [StageState; 3],
    outcome: Option<FilterOutcome>,
    boost: Option<f32>,
    record: Option<SearchRecord>,
}

/// How a finished stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Succeeded,
    Failed(String),
    Skipped,
}

#[derive(Debug)]
pub struct IndexedDocument {
    id: String,
    warc_id: u64,
    document: Document,
    state: Mutex<DocumentState>,
}

impl IndexedDocument {
    /// Wrap a fetched document; its id is `{warc_id}/{offset}`.
    pub fn new(warc_id: u64, document: Document) -> Result<Self> {
        if document.warc_offset < 0 {
            return Err(AppError::validation(format!(
                "negative WARC offset {} for {}",
                document.warc_offset, document.url
            )));
        }
        Ok(Self {
            id: format!("{}/{}", warc_id, document.warc_offset),
            warc_id,
            document,
            state: Mutex::new(DocumentState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn warc_id(&self) -> u64 {
        self.warc_id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    fn state(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, stage: Stage) -> Result<()> {
        let mut state = self.state();
        let tracker = &mut state.stages[stage.index()];
        if tracker.progress != Progress::NotStarted {
            return Err(AppError::stage(&self.id, stage, "stage started twice"));
        }
        tracker.progress = Progress::Started;
        Ok(())
    }

    pub fn finish(&self, stage: Stage) -> Result<()> {
        let mut state = self.state();
        let tracker = &mut state.stages[stage.index()];
        match tracker.progress {
            Progress::Started => {
                tracker.progress = Progress::Finished;
                Ok(())
            }
            Progress::NotStarted => Err(AppError::stage(&self.id, stage, "finished before start")),
            Progress::Finished => Err(AppError::stage(&self.id, stage, "stage finished twice")),
        }
    }

    /// Finish `stage` with an error and skip the stages after it.
    ///
    /// Stages that already finished keep their result.
    pub fn fail(&self, stage: Stage, message: impl Into<String>) {
        let mut state = self.state();
        let tracker = &mut state.stages[stage.index()];
        if tracker.progress != Progress::Finished {
            tracker.progress = Progress::Finished;
            tracker.error = Some(message.into());
        }
        for later in &mut state.stages[stage.index() + 1..] {
            if later.progress != Progress::Finished {
                later.progress = Progress::Finished;
                later.skipped = true;
            }
        }
    }

    pub fn is_finished(&self, stage: Stage) -> bool {
        self.state().stages[stage.index()].progress == Progress::Finished
    }

    /// Result of a finished stage, `None` while it is still running.
    pub fn result(&self, stage: Stage) -> Option<StageResult> {
        let state = self.state();
        let tracker = &state.stages[stage.index()];
        if tracker.progress != Progress::Finished {
            return None;
        }
        Some(match (&tracker.error, tracker.skipped) {
            (Some(message), _) => StageResult::Failed(message.clone()),
            (None, true) => StageResult::Skipped,
            (None, false) => StageResult::Succeeded,
        })
    }

    pub fn error(&self, stage: Stage) -> Option<String> {
        self.state().stages[stage.index()].error.clone()
    }

    pub fn set_outcome(&self, outcome: FilterOutcome) {
        self.state().outcome = Some(outcome);
    }

    pub fn outcome(&self) -> Option<FilterOutcome> {
        self.state().outcome.clone()
    }

    pub fn threshold(&self) -> ContentThreshold {
        self.state()
            .outcome
            .as_ref()
            .map(|o| o.threshold)
            .unwrap_or_default()
    }

    pub fn set_record(&self, record: Option<SearchRecord>) {
        let mut state = self.state();
        state.boost = record.as_ref().map(|r| r.boost);
        state.record = record;
    }

    pub fn record(&self) -> Option<SearchRecord> {
        self.state().record.clone()
    }

    pub fn boost(&self) -> Option<f32> {
        self.state().boost
    }

    pub fn content_length(&self) -> u64 {
        self.document.content_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::document;

    #[test]
    fn test_id_from_warc_and_offset() {
        let doc = IndexedDocument::new(12, document("http://example.com/", 345)).unwrap();
        assert_eq!(doc.id(), "12/345");
        assert_eq!(doc.warc_id(), 12);
    }

    #[test]
    fn test_negative_offset_rejected() {
        assert!(IndexedDocument::new(12, document("http://example.com/", -1)).is_err());
    }

    #[test]
    fn test_stage_lifecycle() {
        let doc = IndexedDocument::new(1, document("http://example.com/", 0)).unwrap();
        assert!(doc.finish(Stage::Filter).is_err());
        doc.start(Stage::Filter).unwrap();
        assert!(doc.start(Stage::Filter).is_err());
        assert!(!doc.is_finished(Stage::Filter));
        assert_eq!(doc.result(Stage::Filter), None);
        doc.finish(Stage::Filter).unwrap();
        assert!(doc.finish(Stage::Filter).is_err());
        assert_eq!(doc.result(Stage::Filter), Some(StageResult::Succeeded));
    }

    #[test]
    fn test_failure_skips_later_stages() {
        let doc = IndexedDocument::new(1, document("http://example.com/", 0)).unwrap();
        doc.start(Stage::Filter).unwrap();
        doc.finish(Stage::Filter).unwrap();
        doc.start(Stage::Transform).unwrap();
        doc.fail(Stage::Transform, "no delivery url");

        assert_eq!(doc.result(Stage::Filter), Some(StageResult::Succeeded));
        assert_eq!(
            doc.result(Stage::Transform),
            Some(StageResult::Failed("no delivery url".into()))
        );
        assert_eq!(doc.result(Stage::Index), Some(StageResult::Skipped));
        assert!(doc.error(Stage::Index).is_none());
    }
}
