use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use actionq_core::ActionArgs;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::CronSpec;

/// Priority given to actions enqueued without one. Lower runs first.
pub const DEFAULT_PRIORITY: u8 = 10;

/// Defines when an action runs and whether it recurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// No schedule: due as soon as it is stored, runs once.
    Null,

    /// Run exactly once at the given UTC instant.
    Single { at: DateTime<Utc> },

    /// Run at `start`, then on every `every_secs` boundary after it.
    Interval {
        start: DateTime<Utc>,
        every_secs: NonZeroU64,
    },

    /// Run on each cron occurrence at or after `start`.
    Cron { start: DateTime<Utc>, cron: CronSpec },
}

/// Store-assigned action identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub i64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ActionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(ActionId)
    }
}

impl ToSql for ActionId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for ActionId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(ActionId)
    }
}

/// Opaque claim identifier. UUID v7, so ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(String);

impl ClaimId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToSql for ClaimId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for ClaimId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(ClaimId)
    }
}

/// Lifecycle state of a stored action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    /// Waiting to be claimed; the only claimable state.
    Pending,
    /// A runner has begun executing it.
    InProgress,
    Complete,
    Failed,
    Canceled,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 5] = [
        ActionStatus::Pending,
        ActionStatus::InProgress,
        ActionStatus::Complete,
        ActionStatus::Failed,
        ActionStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InProgress => "in-progress",
            ActionStatus::Complete => "complete",
            ActionStatus::Failed => "failed",
            ActionStatus::Canceled => "canceled",
        }
    }

    /// Terminal states accept no further transitions except deletion.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ActionStatus::Complete | ActionStatus::Failed | ActionStatus::Canceled
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "in-progress" => Ok(ActionStatus::InProgress),
            "complete" => Ok(ActionStatus::Complete),
            "failed" => Ok(ActionStatus::Failed),
            "canceled" => Ok(ActionStatus::Canceled),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

impl ToSql for ActionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ActionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One schedulable unit of work. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub hook: String,
    pub args: ActionArgs,
    pub schedule: Schedule,
    /// Empty string means "no group".
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Action {
    pub fn new(hook: impl Into<String>, args: ActionArgs, schedule: Schedule) -> Self {
        Self {
            hook: hook.into(),
            args,
            schedule,
            group: String::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_recurring()
    }
}

/// An action as persisted, with its store-managed bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAction {
    pub id: ActionId,
    pub action: Action,
    pub status: ActionStatus,
    pub claim_id: Option<ClaimId>,
    /// Number of times execution has begun.
    pub attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Last claim or execution start, whichever came later.
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredAction {
    pub fn hook(&self) -> &str {
        &self.action.hook
    }

    /// Only pending actions may be executed; every other state is a no-op.
    pub fn is_executable(&self) -> bool {
        self.status == ActionStatus::Pending
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

/// A lease over a batch of pending actions.
///
/// Ids are in execution order: priority, attempts, scheduled time, id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: ClaimId,
    pub action_ids: Vec<ActionId>,
}

impl Claim {
    pub fn is_empty(&self) -> bool {
        self.action_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.action_ids.len()
    }
}

/// Restricts which pending actions a claim may capture. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    pub hooks: Vec<String>,
    pub groups: Vec<String>,
    pub exclude_groups: Vec<String>,
}

impl ClaimFilter {
    pub fn hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hooks = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Optional constraints for [`crate::store::ActionStore::find_action`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindParams {
    pub args: Option<ActionArgs>,
    pub status: Option<ActionStatus>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// General-purpose listing query. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionQuery {
    pub hook: Option<String>,
    pub args: Option<ActionArgs>,
    pub group: Option<String>,
    /// Match any of these statuses; empty matches all.
    pub statuses: Vec<ActionStatus>,
    pub claimed: Option<bool>,
    pub scheduled_before: Option<DateTime<Utc>>,
    pub scheduled_after: Option<DateTime<Utc>>,
    /// Orders by scheduled time, then id.
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}
