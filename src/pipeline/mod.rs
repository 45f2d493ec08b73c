// src/pipeline/mod.rs

//! Indexing pipeline and the loops that drive it.
//!
//! - [`StagePipeline`]: filter, transform and index worker pools
//! - [`ReindexCoordinator`]: feeds WARCs from a [`BatchSource`] into the pipeline
//! - [`RuleChangeReconciler`]: re-evaluates indexed documents when rules change

pub mod batch;
pub mod coordinator;
pub mod document;
pub mod filter;
pub mod reconcile;
pub mod scoring;
pub mod source;
pub mod stages;
pub mod transform;
pub mod window;

pub use batch::{BatchSummary, BatchTracker};
pub use coordinator::{CoordinatorState, CoordinatorStatus, ReindexCoordinator};
pub use document::{IndexedDocument, Stage, StageResult};
pub use reconcile::RuleChangeReconciler;
pub use source::{BatchSource, Modulo, RangeBatchSource, TokenBatchSource};
pub use stages::{QueueDepths, StagePipeline};
pub use window::TimeWindow;
