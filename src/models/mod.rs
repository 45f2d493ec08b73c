// src/models/mod.rs

//! Domain models for the indexer.
//!
//! Configuration, the documents served by the archive, the WARC listings
//! that drive indexing and the access-restriction rules.

mod config;
mod content;
mod document;
mod rule;
mod warc;

// Re-export all public types
pub use config::{
    ArchiveConfig, Config, CoordinatorConfig, FullConfig, PeriodicConfig, PipelineConfig,
    RestrictionsConfig, RetryConfig, SearchConfig, StorageConfig, WindowConfig,
};
pub use content::{ContentThreshold, SearchCategory};
pub use document::{CollectionInfo, Document};
pub use rule::{DateRange, Policy, RangeWidth, Rule, RuleBuilder, RuleRank, RuleRecord};
pub use warc::WarcToIndex;
