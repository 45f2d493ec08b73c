// src/restrictions/engine.rs

//! Per-document rule evaluation.
//!
//! The engine holds the active [`RuleSet`] behind a single `Arc` that is
//! replaced wholesale on refresh, so an evaluation always sees one complete
//! set. The rule manager may pin the evaluation time for the duration of a
//! reconciliation run, and may lock the engine down when the rules can no
//! longer be trusted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::Rule;
use crate::restrictions::RuleSet;
use crate::utils::url::to_surt;

pub struct RestrictionEngine {
    rules: RwLock<Arc<RuleSet>>,
    pinned_now: RwLock<Option<DateTime<Utc>>>,
    locked_down: AtomicBool,
}

impl RestrictionEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            pinned_now: RwLock::new(None),
            locked_down: AtomicBool::new(false),
        }
    }

    /// Rule governing a document captured at `capture`.
    pub fn filter_document(&self, url: &str, capture: DateTime<Utc>) -> Result<Arc<Rule>> {
        self.evaluate_at(url, capture, self.now())
    }

    /// Same as [`RestrictionEngine::filter_document`] with an explicit
    /// evaluation time.
    pub fn evaluate_at(
        &self,
        url: &str,
        capture: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Arc<Rule>> {
        if self.is_locked_down() {
            return Err(AppError::rules_out_of_date(
                "rule evaluation is locked down until rules are refreshed",
            ));
        }

        let rules = self.snapshot();
        let surt = to_surt(url);
        rules
            .check_access(&surt, capture, now)
            .cloned()
            .ok_or_else(|| AppError::no_matching_rule(url))
    }

    /// The evaluation time: the pinned date when set, else the wall clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.pinned_now
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(Utc::now)
    }

    pub fn pin_evaluation_time(&self, at: Option<DateTime<Utc>>) {
        *self
            .pinned_now
            .write()
            .unwrap_or_else(PoisonError::into_inner) = at;
    }

    /// The active rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the active rule set in one step.
    pub fn swap(&self, rules: RuleSet) {
        let count = rules.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        log::info!("Activated rule set with {} rules", count);
    }

    pub fn lock_down(&self, reason: &str) {
        if !self.locked_down.swap(true, Ordering::SeqCst) {
            log::error!("Rule evaluation locked down: {}", reason);
        }
    }

    pub fn release(&self) {
        if self.locked_down.swap(false, Ordering::SeqCst) {
            log::info!("Rule evaluation lockdown released");
        }
    }

    pub fn is_locked_down(&self) -> bool {
        self.locked_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::models::Policy;

    const BASE: &str = "http://www.garnautreview.org.au/ca25734e0016a131/webobj/";

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    }

    /// Catch-all, a 2011-2016 capture restriction on one submission
    /// folder, and a one year embargo on a copy of that folder.
    fn scenario_engine() -> RestrictionEngine {
        let folder = "http://(au,org,garnautreview,)/ca25734e0016a131/webobj/d0841534generalsubmission-ajlester/";
        let fake = "http://(au,org,garnautreview,)/ca25734e0016a131/webobj/fake/d0841534generalsubmission-ajlester/";
        let rules = RuleSet::build(vec![
            Rule::builder(1, Policy::Accepted, "(").build().unwrap(),
            Rule::builder(16, Policy::RestrictedForBoth, folder)
                .captured(Some(at(2011, 6, 1)), Some(at(2016, 6, 1)))
                .build()
                .unwrap(),
            Rule::builder(17, Policy::RestrictedForBoth, fake)
                .embargo_secs(365 * 24 * 3600)
                .build()
                .unwrap(),
        ])
        .unwrap();
        let engine = RestrictionEngine::new(rules);
        engine.pin_evaluation_time(Some(at(2014, 1, 1)));
        engine
    }

    fn policy(engine: &RestrictionEngine, url: &str, capture: DateTime<Utc>) -> Policy {
        engine.filter_document(url, capture).unwrap().policy()
    }

    #[test]
    fn test_capture_range_scenario() {
        let engine = scenario_engine();
        let matching = format!("{BASE}d0841534generalsubmission-ajlester/test.html");
        let other = format!("{BASE}NOT/d0841534generalsubmission-ajlester/test.html");

        assert_eq!(policy(&engine, &matching, at(2013, 1, 1)), Policy::RestrictedForBoth);
        assert_eq!(policy(&engine, &other, at(2013, 1, 1)), Policy::Accepted);
        assert_eq!(policy(&engine, &matching, at(2011, 1, 1)), Policy::Accepted);
    }

    #[test]
    fn test_embargo_scenario() {
        let engine = scenario_engine();
        let matching = format!("{BASE}FAKE/d0841534generalsubmission-ajlester/test.html");
        let other = format!("{BASE}FAKE/NOT/d0841534generalsubmission-ajlester/test.html");

        assert_eq!(policy(&engine, &matching, at(2013, 6, 1)), Policy::RestrictedForBoth);
        assert_eq!(policy(&engine, &matching, at(2012, 6, 1)), Policy::Accepted);
        assert_eq!(policy(&engine, &other, at(2013, 6, 1)), Policy::Accepted);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let engine = scenario_engine();
        let url = format!("{BASE}d0841534generalsubmission-ajlester/a.html");
        let first = engine.filter_document(&url, at(2013, 1, 1)).unwrap();
        let second = engine.filter_document(&url, at(2013, 1, 1)).unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_malformed_url_uses_catch_all() {
        let engine = scenario_engine();
        assert_eq!(engine.filter_document("::::", at(2013, 1, 1)).unwrap().id(), 1);
    }

    #[test]
    fn test_pinned_and_wall_clock() {
        let engine = scenario_engine();
        assert_eq!(engine.now(), at(2014, 1, 1));
        engine.pin_evaluation_time(None);
        assert!(Utc::now() - engine.now() < TimeDelta::seconds(5));
    }

    #[test]
    fn test_lockdown() {
        let engine = scenario_engine();
        engine.lock_down("feed unavailable");
        let err = engine.filter_document("http://nla.gov.au/", at(2013, 1, 1)).unwrap_err();
        assert!(matches!(err, AppError::RulesOutOfDate(_)));
        engine.release();
        assert!(engine.filter_document("http://nla.gov.au/", at(2013, 1, 1)).is_ok());
    }

    #[test]
    fn test_swap_replaces_set() {
        let engine = scenario_engine();
        let url = format!("{BASE}d0841534generalsubmission-ajlester/test.html");
        engine.swap(RuleSet::build(vec![Rule::builder(1, Policy::Accepted, "(").build().unwrap()]).unwrap());
        assert_eq!(policy(&engine, &url, at(2013, 1, 1)), Policy::Accepted);
        assert_eq!(engine.snapshot().len(), 1);
    }
}
