use std::sync::Arc;
use std::time::Duration;

use actionq_core::config::CleanupConfig;
use chrono::{TimeDelta, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::store::ActionStore;

/// What one housekeeping pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub claims_released: usize,
    pub actions_failed: usize,
    pub actions_deleted: usize,
}

/// Recovers work abandoned by dead runners and prunes old history.
pub struct QueueCleaner {
    store: Arc<ActionStore>,
    retention: Duration,
    claim_timeout: Duration,
    failure_timeout: Duration,
    batch_size: usize,
}

impl QueueCleaner {
    pub fn new(store: Arc<ActionStore>, config: &CleanupConfig) -> Self {
        Self {
            store,
            retention: Duration::from_secs(config.retention_secs),
            claim_timeout: Duration::from_secs(config.claim_timeout_secs),
            failure_timeout: Duration::from_secs(config.failure_timeout_secs),
            batch_size: config.batch_size,
        }
    }

    /// Run every housekeeping step once.
    pub fn clean(&self) -> Result<CleanupReport> {
        let report = CleanupReport {
            claims_released: self.reset_timeouts()?,
            actions_failed: self.mark_failures()?,
            actions_deleted: self.delete_old_actions()?,
        };
        if report != CleanupReport::default() {
            info!(
                claims_released = report.claims_released,
                actions_failed = report.actions_failed,
                actions_deleted = report.actions_deleted,
                "queue cleanup finished"
            );
        }
        Ok(report)
    }

    /// Return pending actions whose claim outlived the timeout to the queue.
    pub fn reset_timeouts(&self) -> Result<usize> {
        let n = self.store.release_stale_claims(cutoff(self.claim_timeout))?;
        if n > 0 {
            warn!(count = n, "released stale claims");
        }
        Ok(n)
    }

    /// Fail actions that started executing too long ago and never finished.
    pub fn mark_failures(&self) -> Result<usize> {
        let n = self.store.fail_stale_in_progress(cutoff(self.failure_timeout))?;
        if n > 0 {
            warn!(count = n, "marked timed-out actions as failed");
        }
        Ok(n)
    }

    /// Delete one batch of complete and canceled actions past retention.
    pub fn delete_old_actions(&self) -> Result<usize> {
        self.store
            .delete_finished(cutoff(self.retention), self.batch_size)
    }
}

fn cutoff(age: Duration) -> chrono::DateTime<Utc> {
    let age = TimeDelta::from_std(age).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, ActionStatus, ClaimFilter, Schedule};
    use actionq_core::ActionArgs;
    use rusqlite::Connection;

    fn config(secs: u64) -> CleanupConfig {
        CleanupConfig {
            interval_secs: 60,
            retention_secs: secs,
            claim_timeout_secs: secs,
            failure_timeout_secs: secs,
            batch_size: 10,
        }
    }

    fn setup() -> (Arc<ActionStore>, Vec<crate::types::ActionId>) {
        let store = Arc::new(ActionStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let ids = ["a", "b", "c"]
            .iter()
            .map(|hook| {
                store
                    .save_action(&Action::new(*hook, ActionArgs::new(), Schedule::Null))
                    .unwrap()
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn fresh_work_is_left_alone() {
        let (store, ids) = setup();
        let claim = store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        store.log_execution(ids[1]).unwrap();
        store.mark_complete(ids[2]).unwrap();

        let cleaner = QueueCleaner::new(Arc::clone(&store), &config(3600));
        assert_eq!(cleaner.clean().unwrap(), CleanupReport::default());
        assert_eq!(store.get_claim_id(ids[0]).unwrap(), Some(claim.id));
        assert_eq!(store.get_status(ids[1]).unwrap(), ActionStatus::InProgress);
    }

    #[test]
    fn stale_work_is_recovered_and_history_pruned() {
        let (store, ids) = setup();
        store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        store.log_execution(ids[1]).unwrap();
        store.mark_complete(ids[2]).unwrap();

        // A zero timeout treats everything that already happened as stale.
        let cleaner = QueueCleaner::new(Arc::clone(&store), &config(0));
        let report = cleaner.clean().unwrap();
        assert_eq!(
            report,
            CleanupReport {
                claims_released: 1,
                actions_failed: 1,
                actions_deleted: 1,
            }
        );
        assert_eq!(store.get_claim_id(ids[0]).unwrap(), None);
        assert_eq!(store.get_status(ids[0]).unwrap(), ActionStatus::Pending);
        assert_eq!(store.get_status(ids[1]).unwrap(), ActionStatus::Failed);
        assert!(store.fetch_action(ids[2]).is_err());
    }
}
