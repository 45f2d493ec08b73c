// src/restrictions/rule_set.rs

//! Validated, ranked and immutable set of restriction rules.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::{Rule, RuleRecord};
use crate::restrictions::diff::RulesDiff;

/// Rules ordered by descending rank, so the first match is the winner.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    fingerprint: String,
}

impl RuleSet {
    /// Build a set from validated rules.
    ///
    /// Fails on duplicate ids and when no catch-all rule exists.
    pub fn build(rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(rules.len());
        for rule in &rules {
            if !seen.insert(rule.id()) {
                return Err(AppError::validation(format!(
                    "duplicate rule id {}",
                    rule.id()
                )));
            }
        }
        if !rules.iter().any(Rule::is_catch_all) {
            return Err(AppError::validation(
                "rule set has no unconditional catch-all rule for '('",
            ));
        }

        let mut rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.rank()));
        let fingerprint = fingerprint(&rules);
        Ok(Self { rules, fingerprint })
    }

    /// Validate and build from feed or persisted records.
    pub fn from_records(records: Vec<RuleRecord>) -> Result<Self> {
        let rules = records
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::build(rules)
    }

    /// Highest-ranked rule matching a canonical SURT and capture time.
    pub fn check_access(
        &self,
        surt: &str,
        capture: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.matches(surt, capture, now))
    }

    pub fn get(&self, id: u64) -> Option<&Arc<Rule>> {
        self.rules.iter().find(|r| r.id() == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Rules whose reach changes as time passes, ordered by id.
    pub fn date_based_rules(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<_> = self
            .rules
            .iter()
            .filter(|r| r.has_date_component())
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.id());
        rules
    }

    /// Records ordered by id, the persisted form of the set.
    pub fn records(&self) -> Vec<RuleRecord> {
        let mut records: Vec<_> = self.rules.iter().map(|r| r.to_record()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// SHA-256 over the canonical records.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Changes that turn this set into `newer`.
    pub fn diff(&self, newer: &RuleSet) -> RulesDiff {
        RulesDiff::calculate(&self.rules, &newer.rules)
    }
}

fn fingerprint(rules: &[Arc<Rule>]) -> String {
    let mut records: Vec<_> = rules.iter().map(|r| r.to_record()).collect();
    records.sort_by_key(|r| r.id);

    let mut hasher = Sha256::new();
    for record in &records {
        // Records always serialise, fall back to the id if not
        match serde_json::to_vec(record) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(record.id.to_be_bytes()),
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
