use std::sync::Arc;

use actionq_core::ActionArgs;

use crate::error::Result;

/// The contract between the queue runner and whatever executes actions.
///
/// A call is synchronous: `Ok` means every handler returned normally, `Err`
/// means the action failed. A hook with nothing registered completes as a no-op.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, hook: &str, args: &ActionArgs) -> Result<()>;
}

/// Synchronous handler for one hook.
///
/// Handlers run on the runner's thread and may block; the runner processes
/// a claim strictly in order, so a slow handler delays the rest of its batch.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, args: &ActionArgs) -> Result<()>;
}

impl<F> ActionHandler for F
where
    F: Fn(&ActionArgs) -> Result<()> + Send + Sync,
{
    fn handle(&self, args: &ActionArgs) -> Result<()> {
        self(args)
    }
}

/// A registered handler binding a name, a hook and a priority.
pub struct HandlerDefinition {
    /// Unique name used for deregistration and log correlation.
    pub name: String,
    pub hook: String,
    pub handler: Arc<dyn ActionHandler>,
    /// Lower value = earlier execution. Ties broken by registration order.
    pub priority: i32,
}

impl HandlerDefinition {
    pub fn new(
        name: impl Into<String>,
        hook: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            hook: hook.into(),
            handler,
            priority: 10,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
