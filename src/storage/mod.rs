// src/storage/mod.rs

//! Durable state for the indexer.
//!
//! Two stores sit behind traits so the coordinators and the rule manager
//! never touch the filesystem directly:
//!
//! - [`CheckpointStore`]: indexing progress (last WARC id per mode key,
//!   the sync resumption token) and the per-WARC error table.
//! - [`RuleStateStore`]: the current, staged and previous rule sets plus
//!   the record of the latest reconciliation run.
//!
//! ## Directory Structure
//!
//! ```text
//! storage/
//! ├── checkpoint.json   # last ids, resumption token, error table
//! └── rules.json        # rule set versions and the last run
//! ```

pub mod local;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::RuleRecord;

// Re-export for convenience
pub use local::LocalStorage;

/// Which coordinator an error record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDomain {
    Full,
    Periodic,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Full => f.write_str("full"),
            ErrorDomain::Periodic => f.write_str("periodic"),
        }
    }
}

/// Persisted failure history of one WARC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub warc_id: u64,
    pub last_error: DateTime<Utc>,
    /// Failed attempts after the first one
    pub retries: u32,
    pub domain: ErrorDomain,
}

/// Cumulative work done by a reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkTotals {
    pub rules: u64,
    pub searches: u64,
    pub documents: u64,
    pub written: u64,
    pub elapsed_ms: u64,
}

impl WorkTotals {
    pub fn add(&mut self, other: &WorkTotals) {
        self.rules += other.rules;
        self.searches += other.searches;
        self.documents += other.documents;
        self.written += other.written;
        self.elapsed_ms += other.elapsed_ms;
    }
}

/// Record of a reconciliation run, complete or in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub id: u64,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub date_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub all_completed: Option<DateTime<Utc>>,
    /// Highest rule id fully reconciled in the current phase
    #[serde(default)]
    pub progress_rule_id: Option<u64>,
    #[serde(default)]
    pub totals: WorkTotals,
    /// Fingerprint of the rule set being promoted
    #[serde(default)]
    pub rules_fingerprint: Option<String>,
}

impl LastRun {
    pub fn new(id: u64, started: DateTime<Utc>) -> Self {
        Self {
            id,
            started,
            date_completed: None,
            all_completed: None,
            progress_rule_id: None,
            totals: WorkTotals::default(),
            rules_fingerprint: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.date_completed.is_some() && self.all_completed.is_some()
    }
}

/// All persisted rule set versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleState {
    #[serde(default)]
    pub current: Option<Vec<RuleRecord>>,
    /// Staged set waiting for a reconciliation run to promote it
    #[serde(default)]
    pub new: Option<Vec<RuleRecord>>,
    #[serde(default)]
    pub previous: Option<Vec<RuleRecord>>,
    #[serde(default)]
    pub last_run: Option<LastRun>,
}

/// Progress checkpoints and WARC error tracking.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last fully indexed WARC id for a mode key such as `full`.
    async fn last_id(&self, key: &str) -> Result<Option<u64>>;

    async fn update_last_id(&self, key: &str, id: u64) -> Result<()>;

    async fn resumption_token(&self) -> Result<Option<String>>;

    async fn update_resumption_token(&self, token: &str) -> Result<()>;

    /// Record a failed attempt. Inserts a fresh record or bumps the retry
    /// counter of an existing one, refreshing its timestamp either way.
    async fn track_error(&self, warc_id: u64, domain: ErrorDomain) -> Result<ErrorRecord>;

    async fn check_error(&self, warc_id: u64) -> Result<Option<ErrorRecord>>;

    async fn remove_error(&self, warc_id: u64) -> Result<()>;

    /// Error records of one domain, highest WARC id first.
    async fn old_errors(&self, domain: ErrorDomain) -> Result<Vec<ErrorRecord>>;
}

/// Persistence of rule set versions.
#[async_trait]
pub trait RuleStateStore: Send + Sync {
    async fn load_rule_state(&self) -> Result<RuleState>;

    async fn save_rule_state(&self, state: &RuleState) -> Result<()>;
}
