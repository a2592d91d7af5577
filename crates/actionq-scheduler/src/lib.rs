//! `actionq-scheduler`: persistent at-least-once action queue on SQLite.
//!
//! # Overview
//!
//! Actions (a hook name plus arguments) are persisted to an `actions` table.
//! A [`runner::QueueRunner`] atomically stakes a claim over a batch of due
//! actions, executes them in claim order through a
//! [`actionq_hooks::Dispatcher`], records the outcome and, for recurring
//! schedules, enqueues the next occurrence.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                                |
//! |------------|----------------------------------------------------------|
//! | `Null`     | Run as soon as possible, once                            |
//! | `Single`   | Run once at an absolute UTC instant                      |
//! | `Interval` | Repeat every N seconds on the cadence of the start time  |
//! | `Cron`     | 5-field cron expression evaluated in an IANA timezone    |
//!
//! # Lifecycle
//!
//! `pending → in-progress → complete | failed`, with `canceled` reachable from
//! either non-terminal state. Terminal states are never left.

pub mod cleaner;
pub mod db;
pub mod error;
pub mod lock;
pub mod monitor;
pub mod policy;
pub mod queue;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod types;

pub use cleaner::{CleanupReport, QueueCleaner};
pub use error::{QueueError, Result};
pub use lock::QueueLock;
pub use monitor::{ExecutionMonitor, PastDueMonitor, PastDueReport};
pub use policy::{is_consistently_failing, DefaultFailurePolicy, ExemptHooks, FailurePolicy};
pub use queue::{ActionQueue, EnqueueOptions, NextRun};
pub use runner::{Outcome, ProcessReport, QueueRunner};
pub use schedule::CronSpec;
pub use store::ActionStore;
pub use types::{
    Action, ActionId, ActionQuery, ActionStatus, Claim, ClaimFilter, ClaimId, FindParams,
    Schedule, SortOrder, StoredAction,
};
