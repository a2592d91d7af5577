use std::collections::HashSet;

use crate::error::Result;
use crate::store::ActionStore;
use crate::types::{ActionStatus, StoredAction};

/// Decides whether a recurring action's successor should be suppressed.
///
/// The runner computes `consistently_failing` (the hook's last N finished
/// instances all failed) and hands it over together with the action that just
/// ran. Return `true` to skip scheduling the successor.
pub trait FailurePolicy: Send + Sync {
    fn suppress_successor(&self, consistently_failing: bool, action: &StoredAction) -> bool;
}

impl<F> FailurePolicy for F
where
    F: Fn(bool, &StoredAction) -> bool + Send + Sync,
{
    fn suppress_successor(&self, consistently_failing: bool, action: &StoredAction) -> bool {
        self(consistently_failing, action)
    }
}

/// Suppress exactly when the hook is consistently failing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFailurePolicy;

impl FailurePolicy for DefaultFailurePolicy {
    fn suppress_successor(&self, consistently_failing: bool, _action: &StoredAction) -> bool {
        consistently_failing
    }
}

/// Keep rescheduling the named hooks however often they fail.
#[derive(Debug, Clone, Default)]
pub struct ExemptHooks {
    hooks: HashSet<String>,
}

impl ExemptHooks {
    pub fn new<I, S>(hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hooks: hooks.into_iter().map(Into::into).collect(),
        }
    }
}

impl FailurePolicy for ExemptHooks {
    fn suppress_successor(&self, consistently_failing: bool, action: &StoredAction) -> bool {
        consistently_failing && !self.hooks.contains(action.hook())
    }
}

/// True when the `threshold` most recent finished instances of `hook` all failed.
///
/// Fewer than `threshold` finished instances is never a consistent failure,
/// and a threshold of 0 disables the check.
pub fn is_consistently_failing(store: &ActionStore, hook: &str, threshold: usize) -> Result<bool> {
    if threshold == 0 {
        return Ok(false);
    }
    let outcomes = store.recent_outcomes(hook, threshold)?;
    Ok(outcomes.len() == threshold && outcomes.iter().all(|s| *s == ActionStatus::Failed))
}
