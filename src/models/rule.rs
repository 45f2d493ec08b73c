// src/models/rule.rs

//! Access-restriction rules and their ranking.
//!
//! A [`Rule`] is built from a [`RuleRecord`] as delivered by the rule feed
//! and is immutable afterwards. Rules compete through [`RuleRank`]: among
//! the rules matching a document, the one with the greatest rank applies.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::utils::url::{canonical_rule_surt, to_surt};

/// Indexing policy attached to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Policy {
    Accepted,
    RestrictedForDelivery,
    RestrictedForDiscovery,
    RestrictedForBoth,
    NotApplicable,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Accepted => "ACCEPTED",
            Policy::RestrictedForDelivery => "RESTRICTED_FOR_DELIVERY",
            Policy::RestrictedForDiscovery => "RESTRICTED_FOR_DISCOVERY",
            Policy::RestrictedForBoth => "RESTRICTED_FOR_BOTH",
            Policy::NotApplicable => "NOT_APPLICABLE",
        }
    }

    /// Whether a record under this policy may be delivered to users.
    pub fn is_deliverable(&self) -> bool {
        !matches!(
            self,
            Policy::RestrictedForBoth | Policy::RestrictedForDelivery
        )
    }

    /// Whether a record under this policy may show up in search results.
    pub fn is_discoverable(&self) -> bool {
        !matches!(
            self,
            Policy::RestrictedForBoth | Policy::RestrictedForDiscovery
        )
    }
}

impl FromStr for Policy {
    type Err = AppError;

    /// Parse a feed policy, accepting the legacy `allow`/`block` spellings.
    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "ACCEPTED" | "allow" => Ok(Policy::Accepted),
            "RESTRICTED_FOR_DELIVERY" => Ok(Policy::RestrictedForDelivery),
            "RESTRICTED_FOR_DISCOVERY" => Ok(Policy::RestrictedForDiscovery),
            "RESTRICTED_FOR_BOTH" | "block" | "" => Ok(Policy::RestrictedForBoth),
            "NOT_APPLICABLE" => Ok(Policy::NotApplicable),
            other => Err(AppError::validation(format!("unknown policy '{other}'"))),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A closed date interval, either end may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// How much time a range covers, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RangeWidth {
    Bounded(i64),
    HalfOpen,
    Unbounded,
}

impl DateRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<Self> {
        match (start, end) {
            (None, None) => Err(AppError::validation(
                "date range needs a start or an end",
            )),
            (Some(s), Some(e)) if e < s => Err(AppError::validation(format!(
                "date range ends ({e}) before it starts ({s})"
            ))),
            _ => Ok(Self { start, end }),
        }
    }

    /// Build a range from optional ends, `None` when both are missing.
    pub fn optional(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Option<Self>> {
        if start.is_none() && end.is_none() {
            return Ok(None);
        }
        Self::new(start, end).map(Some)
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Inclusive on both bounds.
    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| date >= s) && self.end.is_none_or(|e| date <= e)
    }

    pub fn width(&self) -> RangeWidth {
        match (self.start, self.end) {
            (Some(s), Some(e)) => RangeWidth::Bounded((e - s).num_seconds()),
            _ => RangeWidth::HalfOpen,
        }
    }
}

fn width_of(range: Option<&DateRange>) -> RangeWidth {
    range.map_or(RangeWidth::Unbounded, DateRange::width)
}

/// Rule as delivered by the rule feed and as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRecord {
    pub id: i64,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub surt: Option<String>,
    #[serde(default)]
    pub exact_match: bool,
    /// Embargo in seconds after capture
    #[serde(default)]
    pub embargo: Option<i64>,
    #[serde(default)]
    pub captured_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub captured_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retrieved_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retrieved_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A validated restriction rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    id: u64,
    policy: Policy,
    surt: String,
    exact: bool,
    embargo: Option<TimeDelta>,
    captured: Option<DateRange>,
    retrieved: Option<DateRange>,
    last_updated: DateTime<Utc>,
}

/// Total order used to pick between matching rules.
///
/// Fields are compared in declaration order and the greatest rank wins:
/// longer SURT, then exact over prefix, then the narrower captured range,
/// then the narrower retrieved range, then the longer embargo, then the
/// higher id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuleRank {
    pub specificity: usize,
    pub exact: bool,
    pub captured: Reverse<RangeWidth>,
    pub retrieved: Reverse<RangeWidth>,
    pub embargo_secs: i64,
    pub id: u64,
}

impl Rule {
    /// Start building a rule. Mostly useful in tests and tooling.
    pub fn builder(id: u64, policy: Policy, surt: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            record: RuleRecord {
                id: id as i64,
                policy: policy.as_str().to_string(),
                surt: Some(surt.into()),
                exact_match: false,
                embargo: None,
                captured_start: None,
                captured_end: None,
                retrieved_start: None,
                retrieved_end: None,
                last_updated: None,
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn surt(&self) -> &str {
        &self.surt
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn embargo(&self) -> Option<TimeDelta> {
        self.embargo
    }

    pub fn captured(&self) -> Option<&DateRange> {
        self.captured.as_ref()
    }

    pub fn retrieved(&self) -> Option<&DateRange> {
        self.retrieved.as_ref()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// An unconditional rule covering every URL.
    pub fn is_catch_all(&self) -> bool {
        self.surt == "("
            && !self.exact
            && self.embargo.is_none()
            && self.captured.is_none()
            && self.retrieved.is_none()
    }

    /// Rules whose effect can change just because time passes.
    pub fn has_date_component(&self) -> bool {
        self.embargo.is_some() || self.captured.is_some() || self.retrieved.is_some()
    }

    /// Whether a change between two versions of a rule can move documents
    /// in or out of its reach (as opposed to a policy-only change).
    pub fn scope_differs(&self, other: &Rule) -> bool {
        self.surt != other.surt
            || self.exact != other.exact
            || self.embargo != other.embargo
            || self.captured != other.captured
            || self.retrieved != other.retrieved
    }

    pub fn rank(&self) -> RuleRank {
        RuleRank {
            specificity: self.surt.chars().count(),
            exact: self.exact,
            captured: Reverse(width_of(self.captured.as_ref())),
            retrieved: Reverse(width_of(self.retrieved.as_ref())),
            embargo_secs: self.embargo.map_or(0, |e| e.num_seconds()),
            id: self.id,
        }
    }

    /// Whether a canonical SURT falls under this rule's pattern.
    pub fn covers(&self, surt: &str) -> bool {
        if self.exact {
            surt == self.surt
        } else {
            surt.starts_with(&self.surt)
        }
    }

    /// Whether this rule applies to a document with the given SURT and
    /// capture time, evaluated at `now`.
    pub fn matches(&self, surt: &str, capture: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.covers(surt) {
            return false;
        }
        if let Some(embargo) = self.embargo {
            // Released exactly when capture + embargo reaches now
            if capture + embargo <= now {
                return false;
            }
        }
        if let Some(range) = &self.captured {
            if !range.contains(capture) {
                return false;
            }
        }
        if let Some(range) = &self.retrieved {
            if !range.contains(now) {
                return false;
            }
        }
        true
    }

    /// Convenience wrapper over [`Rule::matches`] taking a raw URL.
    pub fn matches_url(&self, url: &str, capture: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.matches(&to_surt(url), capture, now)
    }

    pub fn to_record(&self) -> RuleRecord {
        RuleRecord {
            id: self.id as i64,
            policy: self.policy.as_str().to_string(),
            surt: Some(self.surt.clone()),
            exact_match: self.exact,
            embargo: self.embargo.map(|e| e.num_seconds()),
            captured_start: self.captured.and_then(|r| r.start),
            captured_end: self.captured.and_then(|r| r.end),
            retrieved_start: self.retrieved.and_then(|r| r.start),
            retrieved_end: self.retrieved.and_then(|r| r.end),
            last_updated: Some(self.last_updated),
        }
    }
}

impl TryFrom<RuleRecord> for Rule {
    type Error = AppError;

    fn try_from(record: RuleRecord) -> Result<Self> {
        if record.id <= 0 {
            return Err(AppError::validation(format!(
                "rule id must be positive, got {}",
                record.id
            )));
        }
        let id = record.id as u64;

        let raw_surt = record
            .surt
            .as_deref()
            .ok_or_else(|| AppError::validation(format!("rule {id} has no SURT")))?;
        let surt = canonical_rule_surt(raw_surt)
            .map_err(|e| AppError::validation(format!("rule {id}: {e}")))?;

        let embargo = match record.embargo {
            Some(secs) if secs < 0 => {
                return Err(AppError::validation(format!(
                    "rule {id} has a negative embargo"
                )));
            }
            Some(0) | None => None,
            Some(secs) => Some(TimeDelta::seconds(secs)),
        };

        let captured = DateRange::optional(record.captured_start, record.captured_end)
            .map_err(|e| AppError::validation(format!("rule {id} captured range: {e}")))?;
        let retrieved = DateRange::optional(record.retrieved_start, record.retrieved_end)
            .map_err(|e| AppError::validation(format!("rule {id} retrieved range: {e}")))?;

        Ok(Rule {
            id,
            policy: record.policy.parse()?,
            surt,
            exact: record.exact_match,
            embargo,
            captured,
            retrieved,
            last_updated: record.last_updated.unwrap_or_default(),
        })
    }
}

/// Fluent construction of rules through their record form.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    record: RuleRecord,
}

impl RuleBuilder {
    pub fn exact(mut self) -> Self {
        self.record.exact_match = true;
        self
    }

    pub fn embargo_secs(mut self, secs: i64) -> Self {
        self.record.embargo = Some(secs);
        self
    }

    pub fn captured(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.record.captured_start = start;
        self.record.captured_end = end;
        self
    }

    pub fn retrieved(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.record.retrieved_start = start;
        self.record.retrieved_end = end;
        self
    }

    pub fn last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.record.last_updated = Some(at);
        self
    }

    pub fn build(self) -> Result<Rule> {
        Rule::try_from(self.record)
    }
}
