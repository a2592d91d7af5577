use std::time::Duration;

use actionq_core::config::MonitorConfig;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, warn};

use crate::error::Result;
use crate::store::ActionStore;
use crate::types::{ActionId, Claim};

/// Tracks the in-flight action of a claim for the duration of a batch.
///
/// If the runner thread unwinds while an action is tracked, dropping the
/// monitor marks that action failed and releases the claim, so the work does
/// not sit in-progress until housekeeping notices it.
pub struct ExecutionMonitor<'a> {
    store: &'a ActionStore,
    claim: &'a Claim,
    current: Option<ActionId>,
}

impl<'a> ExecutionMonitor<'a> {
    pub fn attach(store: &'a ActionStore, claim: &'a Claim) -> Self {
        Self {
            store,
            claim,
            current: None,
        }
    }

    pub fn track(&mut self, id: ActionId) {
        self.current = Some(id);
    }

    pub fn untrack(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<ActionId> {
        self.current
    }
}

impl Drop for ExecutionMonitor<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        if let Some(id) = self.current.take() {
            error!(action_id = %id, claim_id = %self.claim.id, "runner aborted mid-execution, failing action");
            if let Err(e) = self.store.mark_failure(id) {
                error!(action_id = %id, "could not fail aborted action: {e}");
            }
        }
        if let Err(e) = self.store.release_claim(self.claim) {
            error!(claim_id = %self.claim.id, "could not release claim after abort: {e}");
        }
    }
}

/// Snapshot of the past-due backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PastDueReport {
    pub count: u64,
    pub oldest: Option<DateTime<Utc>>,
    /// Whether `count` reached the configured minimum.
    pub alarming: bool,
}

/// Warns when pending actions fall too far behind their schedule, which
/// usually means no runner is working the queue.
pub struct PastDueMonitor {
    threshold: Duration,
    min_count: u64,
}

impl PastDueMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: Duration::from_secs(config.past_due_secs),
            min_count: config.past_due_min.max(1),
        }
    }

    pub fn check(&self, store: &ActionStore) -> Result<PastDueReport> {
        let age = TimeDelta::from_std(self.threshold).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (count, oldest) = store.past_due(cutoff)?;
        let alarming = count >= self.min_count;
        if alarming {
            warn!(
                count,
                oldest = ?oldest,
                threshold_secs = self.threshold.as_secs(),
                "actions are past due; is a runner working the queue?"
            );
        }
        Ok(PastDueReport {
            count,
            oldest,
            alarming,
        })
    }
}
