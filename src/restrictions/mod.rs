// src/restrictions/mod.rs

//! Access-restriction rules: evaluation, versioning and change detection.

mod diff;
mod engine;
mod manager;
mod rule_set;

pub use diff::{ChangeReason, RuleChange, RulesDiff};
pub use engine::RestrictionEngine;
pub use manager::RuleManager;
pub use rule_set::RuleSet;
