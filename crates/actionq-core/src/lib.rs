//! `actionq-core`: configuration, errors and value types shared by every
//! ActionQ crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::QueueConfig;
pub use error::{CoreError, Result};
pub use types::ActionArgs;
