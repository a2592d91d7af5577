use std::sync::Arc;
use std::time::Duration;

use actionq_core::QueueConfig;
use actionq_scheduler::{
    db, ActionStore, CleanupReport, PastDueMonitor, QueueCleaner, QueueLock, Result,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Lock that keeps housekeeping to one pass per interval across processes.
pub const CLEANUP_LOCK: &str = "cleanup";

/// Periodic stale-claim recovery, history pruning and past-due alerting.
pub struct Housekeeper {
    store: Arc<ActionStore>,
    lock: QueueLock,
    cleaner: QueueCleaner,
    past_due: PastDueMonitor,
    interval: Duration,
}

impl Housekeeper {
    pub fn new(store: Arc<ActionStore>, lock: QueueLock, config: &QueueConfig) -> Self {
        Self {
            cleaner: QueueCleaner::new(Arc::clone(&store), &config.cleanup),
            past_due: PastDueMonitor::new(&config.monitor),
            interval: Duration::from_secs(config.cleanup.interval_secs.max(1)),
            store,
            lock,
        }
    }

    /// Open dedicated connections to the configured database.
    pub fn open(config: &QueueConfig) -> Result<Self> {
        let busy = Duration::from_millis(config.database.busy_timeout_ms);
        let store = Arc::new(ActionStore::open(&config.database.path, busy)?);
        let lock = QueueLock::new(db::open(&config.database.path, busy)?)?;
        Ok(Self::new(store, lock, config))
    }

    /// One pass, unless another process already ran this period's.
    pub fn tick(&self) -> Result<Option<CleanupReport>> {
        if !self.lock.set(CLEANUP_LOCK, self.interval)? {
            debug!("housekeeping already done this period");
            return Ok(None);
        }
        let report = self.cleaner.clean()?;
        self.past_due.check(&self.store)?;
        Ok(Some(report))
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "housekeeping started");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || this.tick()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(code = e.code(), "housekeeping failed: {e}"),
                        Err(e) => error!("housekeeping task died: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("housekeeping stopped");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actionq_core::ActionArgs;
    use actionq_scheduler::{Action, ActionStatus, ClaimFilter, Schedule};

    fn config(dir: &tempfile::TempDir) -> QueueConfig {
        let mut config = QueueConfig::default();
        config.database.path = dir.path().join("queue.db").display().to_string();
        config.cleanup.claim_timeout_secs = 0;
        config
    }

    #[test]
    fn runs_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let first = Housekeeper::open(&config).unwrap();
        let second = Housekeeper::open(&config).unwrap();

        let id = first
            .store
            .save_action(&Action::new("a", ActionArgs::new(), Schedule::Null))
            .unwrap();
        first
            .store
            .stake_claim(1, None, &ClaimFilter::default())
            .unwrap();

        let report = first.tick().unwrap().expect("first pass runs");
        assert_eq!(report.claims_released, 1);
        assert_eq!(first.store.get_claim_id(id).unwrap(), None);
        assert_eq!(first.store.get_status(id).unwrap(), ActionStatus::Pending);

        // Same database, different process: the lock is held.
        assert_eq!(second.tick().unwrap(), None);
        assert_eq!(first.tick().unwrap(), None);
    }
}
