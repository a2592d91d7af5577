//! `actionq-hooks`: dispatch of queued actions to registered handlers.
//!
//! The queue runner only sees the [`Dispatcher`] trait: given a hook name and
//! its arguments, invoke whatever is registered and report success or failure.
//! [`HookRegistry`] is the in-process implementation.

pub mod error;
pub mod registry;
pub mod types;

pub use error::HandlerError;
pub use registry::HookRegistry;
pub use types::{ActionHandler, Dispatcher, HandlerDefinition};
