// src/restrictions/diff.rs

//! Diff calculation between two rule set versions.
//!
//! Changes are keyed by rule id so a reconciliation run works through them
//! in a stable order and can resume after the last id it finished.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::models::Rule;

/// Why a rule shows up in a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    New,
    Changed,
    Deleted,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeReason::New => f.write_str("NEW"),
            ChangeReason::Changed => f.write_str("CHANGED"),
            ChangeReason::Deleted => f.write_str("DELETED"),
        }
    }
}

/// One rule that differs between two versions.
#[derive(Debug, Clone)]
pub struct RuleChange {
    /// The rule as it was, or the added rule for [`ChangeReason::New`]
    pub rule: Arc<Rule>,
    /// Replacement for a [`ChangeReason::Changed`] rule
    pub new_rule: Option<Arc<Rule>>,
    pub reason: ChangeReason,
}

impl RuleChange {
    pub fn id(&self) -> u64 {
        self.rule.id()
    }
}

/// Ordered set of rule changes.
#[derive(Debug, Clone, Default)]
pub struct RulesDiff {
    changes: BTreeMap<u64, RuleChange>,
}

impl RulesDiff {
    /// Calculate the changes that turn `previous` into `current`.
    pub fn calculate(previous: &[Arc<Rule>], current: &[Arc<Rule>]) -> Self {
        let prev_map: HashMap<u64, &Arc<Rule>> = previous.iter().map(|r| (r.id(), r)).collect();
        let curr_map: HashMap<u64, &Arc<Rule>> = current.iter().map(|r| (r.id(), r)).collect();

        let mut changes = BTreeMap::new();

        // Added or changed: look at every current rule
        for (id, curr) in &curr_map {
            match prev_map.get(id) {
                None => {
                    changes.insert(
                        *id,
                        RuleChange {
                            rule: Arc::clone(curr),
                            new_rule: None,
                            reason: ChangeReason::New,
                        },
                    );
                }
                Some(prev) if prev != curr => {
                    changes.insert(
                        *id,
                        RuleChange {
                            rule: Arc::clone(prev),
                            new_rule: Some(Arc::clone(curr)),
                            reason: ChangeReason::Changed,
                        },
                    );
                }
                Some(_) => {}
            }
        }

        // Removed: in previous but not in current
        for (id, prev) in &prev_map {
            if !curr_map.contains_key(id) {
                changes.insert(
                    *id,
                    RuleChange {
                        rule: Arc::clone(prev),
                        new_rule: None,
                        reason: ChangeReason::Deleted,
                    },
                );
            }
        }

        Self { changes }
    }

    /// Treat every rule as new, for a first run without a previous set.
    pub fn all_new(current: &[Arc<Rule>]) -> Self {
        Self::calculate(&[], current)
    }

    pub fn has_work_left(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Drop changes already handled: every id up to and including `progress`.
    pub fn filter_after(&mut self, progress: u64) {
        self.changes = self.changes.split_off(&progress.saturating_add(1));
    }

    /// Take the change with the lowest rule id.
    pub fn next(&mut self) -> Option<RuleChange> {
        self.changes.pop_first().map(|(_, change)| change)
    }

    pub fn count(&self, reason: ChangeReason) -> usize {
        self.changes.values().filter(|c| c.reason == reason).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleChange> {
        self.changes.values()
    }
}

impl fmt::Display for RulesDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} new, {} changed, {} deleted",
            self.count(ChangeReason::New),
            self.count(ChangeReason::Changed),
            self.count(ChangeReason::Deleted)
        )
    }
}
