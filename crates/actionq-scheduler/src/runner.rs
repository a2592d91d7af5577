use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actionq_core::config::{FailureConfig, RunnerConfig};
use actionq_hooks::{Dispatcher, HandlerError};
use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{QueueError, Result};
use crate::monitor::ExecutionMonitor;
use crate::policy::{is_consistently_failing, DefaultFailurePolicy, FailurePolicy};
use crate::store::ActionStore;
use crate::types::{ActionId, ActionStatus, Claim, ClaimFilter, StoredAction};

/// How a single action ended up after the runner reached it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// The handler returned an error or panicked.
    Failed(HandlerError),
    /// The action was no longer pending when the runner got to it.
    Skipped(ActionStatus),
    /// Someone else finished or canceled the action while its handler ran.
    Interrupted(ActionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub action_id: ActionId,
    pub outcome: Outcome,
    /// Next occurrence enqueued for a recurring action.
    pub successor: Option<ActionId>,
}

impl ProcessReport {
    fn new(action_id: ActionId, outcome: Outcome) -> Self {
        Self {
            action_id,
            outcome,
            successor: None,
        }
    }
}

/// Claims due actions in batches and executes them through a [`Dispatcher`].
///
/// Each runner should own its own [`ActionStore`] connection; runners in other
/// threads or processes coordinate only through claims in the database.
pub struct QueueRunner {
    store: Arc<ActionStore>,
    dispatcher: Arc<dyn Dispatcher>,
    policy: Arc<dyn FailurePolicy>,
    filter: ClaimFilter,
    batch_size: usize,
    concurrent_batches: u64,
    time_limit: Duration,
    poll_interval: Duration,
    failure_threshold: usize,
}

impl QueueRunner {
    pub fn new(
        store: Arc<ActionStore>,
        dispatcher: Arc<dyn Dispatcher>,
        runner: &RunnerConfig,
        failure: &FailureConfig,
    ) -> Self {
        let filter = ClaimFilter::default()
            .hooks(runner.hooks.iter().cloned())
            .groups(runner.groups.iter().cloned())
            .exclude_groups(runner.exclude_groups.iter().cloned());
        Self {
            store,
            dispatcher,
            policy: Arc::new(DefaultFailurePolicy),
            filter,
            batch_size: runner.batch_size,
            concurrent_batches: runner.concurrent_batches.max(1) as u64,
            time_limit: Duration::from_secs(runner.time_limit_secs),
            poll_interval: Duration::from_secs(runner.poll_interval_secs.max(1)),
            failure_threshold: failure.threshold,
        }
    }

    /// Replace the default consistent-failure policy.
    pub fn with_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }

    /// How many actions this runner's filters would claim right now.
    pub fn count_due(&self) -> Result<u64> {
        self.store.count_due(None, &self.filter)
    }

    /// Process batches until one comes back empty or the time limit passes.
    ///
    /// Returns 0 without claiming when the configured number of batches is
    /// already outstanding. Handler failures never surface here; a store error
    /// aborts the run and leaves the current claim for the cleaner.
    pub fn run(&self) -> Result<usize> {
        let deadline = Instant::now() + self.time_limit;
        let mut processed = 0;
        loop {
            let outstanding = self.store.get_claim_count()?;
            if outstanding >= self.concurrent_batches {
                debug!(
                    outstanding,
                    limit = self.concurrent_batches,
                    "batch limit reached, not claiming"
                );
                break;
            }
            let n = self.run_batch(deadline)?;
            processed += n;
            if n == 0 || Instant::now() >= deadline {
                break;
            }
        }
        if processed > 0 {
            info!(processed, "queue run finished");
        }
        Ok(processed)
    }

    #[instrument(skip(self, deadline))]
    fn run_batch(&self, deadline: Instant) -> Result<usize> {
        let claim = self
            .store
            .stake_claim(self.batch_size, None, &self.filter)?;
        if claim.is_empty() {
            return Ok(0);
        }
        let processed = match self.execute_claim(&claim, deadline) {
            Ok(n) => n,
            Err(e) => {
                error!(claim_id = %claim.id, code = e.code(), "batch aborted: {e}");
                return Err(e);
            }
        };
        self.store.release_claim(&claim)?;
        Ok(processed)
    }

    fn execute_claim(&self, claim: &Claim, deadline: Instant) -> Result<usize> {
        let mut monitor = ExecutionMonitor::attach(&self.store, claim);
        let mut processed = 0;
        // Claim order is execution order.
        for &id in &claim.action_ids {
            self.process_action(id, Some(&mut monitor))?;
            processed += 1;
            if Instant::now() >= deadline {
                debug!(processed, remaining = claim.len() - processed, "time limit reached mid-batch");
                break;
            }
        }
        Ok(processed)
    }

    /// Execute one action by id outside any claim.
    ///
    /// Handler failures are reported in the outcome; only store errors
    /// (including an unknown id) are returned as `Err`.
    pub fn process_one(&self, id: ActionId) -> Result<ProcessReport> {
        self.process_action(id, None)
    }

    fn process_action(
        &self,
        id: ActionId,
        mut monitor: Option<&mut ExecutionMonitor<'_>>,
    ) -> Result<ProcessReport> {
        let stored = self.store.fetch_action(id)?;
        if !stored.is_executable() {
            debug!(action_id = %id, status = %stored.status, "action no longer pending, skipping");
            return Ok(ProcessReport::new(id, Outcome::Skipped(stored.status)));
        }
        match self.store.log_execution(id) {
            Ok(()) => {}
            Err(QueueError::InvalidTransition { from, .. }) => {
                debug!(action_id = %id, status = %from, "action taken elsewhere, skipping");
                return Ok(ProcessReport::new(id, Outcome::Skipped(from)));
            }
            Err(e) => return Err(e),
        }

        if let Some(monitor) = monitor.as_mut() {
            monitor.track(id);
        }
        let result = self.dispatch(&stored);
        let recorded = match &result {
            Ok(()) => self.store.mark_complete(id),
            Err(_) => self.store.mark_failure(id),
        };
        if let Some(monitor) = monitor.as_mut() {
            monitor.untrack();
        }

        let outcome = match (result, recorded) {
            (_, Err(QueueError::InvalidTransition { from, .. })) => {
                warn!(action_id = %id, status = %from, "action changed state while running, leaving it");
                return Ok(ProcessReport::new(id, Outcome::Interrupted(from)));
            }
            (_, Err(e)) => return Err(e),
            (Ok(()), Ok(())) => {
                info!(action_id = %id, hook = %stored.hook(), "action completed");
                Outcome::Completed
            }
            (Err(handler_err), Ok(())) => {
                warn!(action_id = %id, hook = %stored.hook(), "action failed: {handler_err}");
                Outcome::Failed(handler_err)
            }
        };

        let successor = if stored.action.is_recurring() {
            self.schedule_successor(&stored)
        } else {
            None
        };
        Ok(ProcessReport {
            action_id: id,
            outcome,
            successor,
        })
    }

    fn dispatch(&self, stored: &StoredAction) -> std::result::Result<(), HandlerError> {
        let dispatcher = &self.dispatcher;
        catch_unwind(AssertUnwindSafe(|| {
            dispatcher.dispatch(stored.hook(), &stored.action.args)
        }))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
    }

    /// Errors here are logged and swallowed: the finished instance is already recorded.
    fn schedule_successor(&self, stored: &StoredAction) -> Option<ActionId> {
        match self.try_schedule_successor(stored) {
            Ok(next) => next,
            Err(e) => {
                error!(
                    action_id = %stored.id,
                    hook = %stored.hook(),
                    code = e.code(),
                    "could not schedule next occurrence: {e}"
                );
                None
            }
        }
    }

    fn try_schedule_successor(&self, stored: &StoredAction) -> Result<Option<ActionId>> {
        let failing = is_consistently_failing(&self.store, stored.hook(), self.failure_threshold)?;
        if self.policy.suppress_successor(failing, stored) {
            warn!(
                action_id = %stored.id,
                hook = %stored.hook(),
                threshold = self.failure_threshold,
                "hook keeps failing, next occurrence not scheduled"
            );
            return Ok(None);
        }
        // Past the slot that just ran, which may be ahead of now when run early.
        // Stored times are whole seconds, so the slot itself ends a second later.
        let ran = stored
            .scheduled_at
            .checked_add_signed(TimeDelta::seconds(1))
            .unwrap_or(stored.scheduled_at);
        let Some(next) = stored.action.schedule.next(Some(Utc::now().max(ran))) else {
            debug!(action_id = %stored.id, "schedule has no further occurrences");
            return Ok(None);
        };
        let id = self.store.save_action_at(&stored.action, next)?;
        info!(
            action_id = %id,
            previous = %stored.id,
            hook = %stored.hook(),
            scheduled_at = %next,
            "next occurrence scheduled"
        );
        Ok(Some(id))
    }

    /// Poll the queue every interval until `shutdown` flips to `true`.
    ///
    /// Each run happens on the blocking pool; a shutdown request waits for the
    /// run in flight to finish.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.batch_size,
            poll_secs = self.poll_interval.as_secs(),
            "queue runner started"
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let runner = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || runner.run()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(code = e.code(), "queue run failed: {e}"),
                        Err(e) => error!("queue run task died: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("queue runner shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
