use std::sync::{Arc, RwLock};
use std::time::Instant;

use actionq_core::ActionArgs;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{ActionHandler, Dispatcher, HandlerDefinition};

/// Registry of action handlers keyed by hook name.
///
/// Share one instance per process as `Arc<HookRegistry>`; runners receive it
/// as an `Arc<dyn Dispatcher>`.
pub struct HookRegistry {
    /// Sorted by priority ascending after every registration.
    handlers: RwLock<Vec<HandlerDefinition>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler. Re-sorts the list so priority order is always correct.
    pub fn register(&self, definition: HandlerDefinition) {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        debug!(name = %definition.name, hook = %definition.hook, "handler registered");
        handlers.push(definition);
        // Stable sort preserves registration order within the same priority.
        handlers.sort_by_key(|h| h.priority);
    }

    /// Shorthand for registering a handler under its hook name at default priority.
    pub fn on(&self, hook: impl Into<String>, handler: impl ActionHandler + 'static) {
        let hook = hook.into();
        self.register(HandlerDefinition::new(hook.clone(), hook, Arc::new(handler)));
    }

    /// Remove a handler by name. Silent no-op if the name is not found.
    pub fn unregister(&self, name: &str) {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        let before = handlers.len();
        handlers.retain(|h| h.name != name);
        if handlers.len() < before {
            debug!(name, "handler unregistered");
        }
    }

    pub fn has_handlers(&self, hook: &str) -> bool {
        let handlers = self.handlers.read().expect("handler registry poisoned");
        handlers.iter().any(|h| h.hook == hook)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for HookRegistry {
    /// Run every handler for `hook` in priority order.
    ///
    /// Stops at the first error; later handlers do not run for this attempt.
    fn dispatch(&self, hook: &str, args: &ActionArgs) -> Result<()> {
        // Clone the matching handlers so none of them runs under the lock.
        let matching: Vec<(String, Arc<dyn ActionHandler>)> = {
            let handlers = self.handlers.read().expect("handler registry poisoned");
            handlers
                .iter()
                .filter(|h| h.hook == hook)
                .map(|h| (h.name.clone(), Arc::clone(&h.handler)))
                .collect()
        };

        if matching.is_empty() {
            debug!(hook, "no handlers registered, nothing to run");
            return Ok(());
        }

        for (name, handler) in matching {
            let t = Instant::now();
            let result = handler.handle(args);
            let elapsed_ms = t.elapsed().as_millis() as u64;

            if let Err(ref e) = result {
                warn!(handler = %name, hook, duration_ms = elapsed_ms, error = %e, "handler failed");
                return result;
            }
            debug!(handler = %name, hook, duration_ms = elapsed_ms, "handler completed");
        }
        Ok(())
    }
}
