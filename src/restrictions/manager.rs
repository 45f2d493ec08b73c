// src/restrictions/manager.rs

//! Rule set versions and reconciliation run bookkeeping.
//!
//! Three versions of the rules are kept: `current` is authoritative,
//! `new` is staged while a reconciliation run brings the index in line
//! with it, and `previous` is retained for rollback. The [`LastRun`]
//! record tells a restarted process whether it stopped in the middle of a
//! run and which phase it reached:
//!
//! | last run                 | state                                   |
//! |--------------------------|-----------------------------------------|
//! | none                     | recovery, nothing may be staged         |
//! | dates not completed      | recovery, nothing may be staged yet     |
//! | dates done, run not done | recovery, staged rules resume the diff  |
//! | complete                 | normal                                  |

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{Rule, RuleRecord};
use crate::restrictions::{RestrictionEngine, RuleSet, RulesDiff};
use crate::services::RuleFeed;
use crate::storage::{LastRun, RuleState, RuleStateStore, WorkTotals};

struct ManagerState {
    current: Option<RuleSet>,
    new: Option<RuleSet>,
    previous: Option<Vec<RuleRecord>>,
    last_run: Option<LastRun>,
    recovery: bool,
}

impl ManagerState {
    fn to_persisted(&self) -> RuleState {
        RuleState {
            current: self.current.as_ref().map(RuleSet::records),
            new: self.new.as_ref().map(RuleSet::records),
            previous: self.previous.clone(),
            last_run: self.last_run.clone(),
        }
    }

    fn progress(&self) -> Option<u64> {
        self.last_run.as_ref().and_then(|r| r.progress_rule_id)
    }
}

/// Owner of the rule set versions and the engine evaluating them.
pub struct RuleManager {
    store: Arc<dyn RuleStateStore>,
    feed: Arc<dyn RuleFeed>,
    engine: Arc<RestrictionEngine>,
    state: Mutex<ManagerState>,
}

fn rebuild(label: &str, records: Option<Vec<RuleRecord>>) -> Result<Option<RuleSet>> {
    records
        .map(RuleSet::from_records)
        .transpose()
        .map_err(|e| AppError::config(format!("persisted {label} rule set is invalid: {e}")))
}

impl RuleManager {
    /// Load persisted state and work out whether a run was interrupted.
    ///
    /// On the very first start the feed is fetched and staged, together
    /// with a run record whose date phase is already done, so the first
    /// reconciliation treats every rule as new.
    pub async fn initialise(
        store: Arc<dyn RuleStateStore>,
        feed: Arc<dyn RuleFeed>,
    ) -> Result<Self> {
        let persisted = store.load_rule_state().await?;
        let current = rebuild("current", persisted.current)?;
        let mut new = rebuild("new", persisted.new)?;
        let mut last_run = persisted.last_run;

        let mut recovery = false;
        let mut pinned = None;
        match &last_run {
            None => {
                recovery = true;
                if new.is_some() {
                    return Err(AppError::config(
                        "staged rules found without any recorded run, state looks corrupted",
                    ));
                }
            }
            Some(run) => {
                if run.date_completed.is_none() {
                    recovery = true;
                    pinned = Some(run.started);
                    if new.is_some() {
                        return Err(AppError::config(
                            "staged rules found before the date phase of the run completed",
                        ));
                    }
                } else {
                    pinned = run.date_completed;
                }
                if run.all_completed.is_none() {
                    recovery = true;
                } else {
                    // A finished run evaluates against the wall clock again
                    pinned = None;
                }
            }
        }

        log::info!(
            "Found {} current rules",
            current.as_ref().map_or(0, RuleSet::len)
        );
        log::info!("Found {} new rules", new.as_ref().map_or(0, RuleSet::len));
        match &last_run {
            None => log::info!("Rules have never been reconciled"),
            Some(run) => log::info!(
                "Rules last reconciled on {}, {}",
                run.started,
                run.all_completed
                    .map_or("INCOMPLETE".to_string(), |at| format!("completed {at}"))
            ),
        }

        if current.is_none() && new.is_none() {
            let records = feed.fetch_rules().await.map_err(|e| {
                AppError::rules_out_of_date(format!("initial rule fetch failed: {e}"))
            })?;
            let fresh = RuleSet::from_records(records)?;
            log::info!("Staging {} rules from the feed for a first run", fresh.len());

            let now = Utc::now();
            let mut run = LastRun::new(last_run.as_ref().map_or(1, |r| r.id + 1), now);
            run.date_completed = Some(now);
            run.rules_fingerprint = Some(fresh.fingerprint().to_string());
            pinned = Some(now);
            last_run = Some(run);
            new = Some(fresh);
            recovery = true;
        }

        let in_use = match (&new, &current) {
            (Some(rules), _) | (None, Some(rules)) => rules.clone(),
            (None, None) => {
                return Err(AppError::config("no rule set available"));
            }
        };
        let engine = Arc::new(RestrictionEngine::new(in_use));
        engine.pin_evaluation_time(pinned);

        let state = ManagerState {
            current,
            new,
            previous: persisted.previous,
            last_run,
            recovery,
        };
        store.save_rule_state(&state.to_persisted()).await?;

        Ok(Self {
            store,
            feed,
            engine,
            state: Mutex::new(state),
        })
    }

    /// Engine evaluating the rules in use.
    pub fn engine(&self) -> Arc<RestrictionEngine> {
        Arc::clone(&self.engine)
    }

    pub async fn is_in_recovery(&self) -> bool {
        self.state.lock().await.recovery
    }

    pub async fn last_run(&self) -> Option<LastRun> {
        self.state.lock().await.last_run.clone()
    }

    /// Fingerprint of the authoritative rule set.
    pub async fn current_fingerprint(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.current.as_ref().map(|r| r.fingerprint().to_string())
    }

    /// Whether a reconciliation run is due right away.
    pub async fn needs_run_now(&self) -> bool {
        let state = self.state.lock().await;
        if state.recovery {
            return true;
        }
        match state.last_run.as_ref().and_then(|r| r.all_completed) {
            Some(completed) => Utc::now() - completed > TimeDelta::days(1),
            None => true,
        }
    }

    async fn persist(&self, state: &ManagerState) -> Result<()> {
        self.store.save_rule_state(&state.to_persisted()).await
    }

    /// Begin a run, or resume the incomplete one.
    pub async fn start_run(&self) -> Result<LastRun> {
        let mut state = self.state.lock().await;
        let run = match &state.last_run {
            Some(run) if !run.is_complete() => {
                log::info!("Resuming reconciliation run {}", run.id);
                run.clone()
            }
            previous => {
                let run = LastRun::new(previous.as_ref().map_or(1, |r| r.id + 1), Utc::now());
                log::info!("Starting reconciliation run {}", run.id);
                state.last_run = Some(run.clone());
                self.persist(&state).await?;
                run
            }
        };

        let pinned = run.date_completed.unwrap_or(run.started);
        self.engine.pin_evaluation_time(Some(pinned));
        Ok(run)
    }

    /// Date-based rules of the current set still to be handled in this run.
    ///
    /// Empty once the date phase is done or when no current set exists.
    pub async fn date_rules(&self) -> Vec<Arc<Rule>> {
        let state = self.state.lock().await;
        let Some(run) = &state.last_run else {
            return Vec::new();
        };
        let Some(current) = &state.current else {
            return Vec::new();
        };
        if run.date_completed.is_some() {
            return Vec::new();
        }

        // Documents processed meanwhile must see the current rules
        self.engine.swap(current.clone());

        let progress = run.progress_rule_id.unwrap_or(0);
        current
            .date_based_rules()
            .into_iter()
            .filter(|r| r.id() >= progress)
            .collect()
    }

    /// Close the date phase and pin its completion date for the diff phase.
    pub async fn finish_date_rules(&self) -> Result<DateTime<Utc>> {
        let mut state = self.state.lock().await;
        let run = state
            .last_run
            .as_mut()
            .ok_or_else(|| AppError::reconcile("no run in progress"))?;

        let completed = match run.date_completed {
            Some(at) => at,
            None => {
                let now = Utc::now();
                run.date_completed = Some(now);
                // Diff progress is tracked separately from date progress
                run.progress_rule_id = None;
                self.persist(&state).await?;
                now
            }
        };
        self.engine.pin_evaluation_time(Some(completed));
        Ok(completed)
    }

    /// Diff between the current rules and the feed, staging the new set.
    ///
    /// Returns `None` when nothing changed. A run interrupted after staging
    /// resumes from the staged set without calling the feed. Failing to
    /// obtain or persist the rules locks the engine down.
    pub async fn check_for_changed_rules(&self) -> Result<Option<RulesDiff>> {
        let mut state = self.state.lock().await;

        if state.recovery {
            if let Some(staged) = &state.new {
                let mut diff = match &state.current {
                    Some(current) => current.diff(staged),
                    None => RulesDiff::all_new(staged.rules()),
                };
                if let Some(progress) = state.progress() {
                    diff.filter_after(progress);
                }
                self.engine.swap(staged.clone());
                log::info!("Resuming staged rules: {}", diff);
                return Ok(Some(diff));
            }
        }

        let fresh = match self.fetch_fresh().await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.engine.lock_down(&e.to_string());
                return Err(AppError::rules_out_of_date(e.to_string()));
            }
        };

        let diff = match &state.current {
            None => RulesDiff::all_new(fresh.rules()),
            Some(current) => current.diff(&fresh),
        };
        if !diff.has_work_left() {
            log::info!("No rule changes received");
            return Ok(None);
        }

        log::info!("Changed rules received: {}", diff);
        if let Some(run) = state.last_run.as_mut() {
            run.rules_fingerprint = Some(fresh.fingerprint().to_string());
        }
        state.new = Some(fresh.clone());
        if let Err(e) = self.persist(&state).await {
            self.engine.lock_down(&e.to_string());
            return Err(AppError::rules_out_of_date(format!(
                "could not persist staged rules: {e}"
            )));
        }
        self.engine.swap(fresh);
        Ok(Some(diff))
    }

    async fn fetch_fresh(&self) -> Result<RuleSet> {
        let records = self.feed.fetch_rules().await?;
        RuleSet::from_records(records)
    }

    /// Record that every document affected by `rule_id` was handled.
    pub async fn store_work_log(&self, rule_id: u64, work: &WorkTotals) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state
            .last_run
            .as_mut()
            .ok_or_else(|| AppError::reconcile("no run in progress"))?;
        run.progress_rule_id = Some(rule_id);
        run.totals.add(work);
        self.persist(&state).await
    }

    /// Promote the staged set and close the run.
    pub async fn finish_run(&self) -> Result<LastRun> {
        let mut state = self.state.lock().await;
        let run = state
            .last_run
            .as_mut()
            .ok_or_else(|| AppError::reconcile("no run in progress"))?;
        if run.all_completed.is_none() {
            run.all_completed = Some(Utc::now());
        }
        let finished = run.clone();

        if let Some(staged) = state.new.take() {
            state.previous = state.current.as_ref().map(RuleSet::records);
            log::info!(
                "Promoting {} staged rules ({})",
                staged.len(),
                staged.fingerprint()
            );
            state.current = Some(staged);
        }
        self.persist(&state).await?;

        if let Some(current) = &state.current {
            self.engine.swap(current.clone());
        }
        self.engine.pin_evaluation_time(None);
        self.engine.release();
        state.recovery = false;
        Ok(finished)
    }

    /// Leave the run unfinished after a failure.
    ///
    /// The staged set stays persisted so the next run resumes it, while
    /// the current set goes back into use.
    pub async fn abort_run(&self, reason: &str) {
        let mut state = self.state.lock().await;
        log::error!("Reconciliation run aborted: {}", reason);
        state.recovery = true;
        if let Some(current) = &state.current {
            self.engine.swap(current.clone());
        }
        self.engine.pin_evaluation_time(None);
    }

    /// Stage the previous rule set for the next run to restore.
    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.last_run.as_ref().is_some_and(|r| !r.is_complete()) {
            return Err(AppError::reconcile(
                "cannot roll back while a reconciliation run is incomplete",
            ));
        }
        let previous = state
            .previous
            .clone()
            .ok_or_else(|| AppError::reconcile("no previous rule set to roll back to"))?;
        let restored = RuleSet::from_records(previous)?;

        let now = Utc::now();
        let mut run = LastRun::new(state.last_run.as_ref().map_or(1, |r| r.id + 1), now);
        run.date_completed = Some(now);
        run.rules_fingerprint = Some(restored.fingerprint().to_string());

        log::warn!(
            "Rolling back to {} previous rules ({})",
            restored.len(),
            restored.fingerprint()
        );
        state.last_run = Some(run);
        state.new = Some(restored.clone());
        state.recovery = true;
        self.persist(&state).await?;
        self.engine.swap(restored);
        Ok(())
    }
}
