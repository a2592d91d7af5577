use std::sync::Arc;

use actionq_core::ActionArgs;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::info;

use crate::error::{QueueError, Result};
use crate::schedule::CronSpec;
use crate::store::ActionStore;
use crate::types::{
    Action, ActionId, ActionQuery, ActionStatus, FindParams, Schedule, DEFAULT_PRIORITY,
};

/// Per-enqueue options shared by every scheduling call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub group: String,
    pub priority: u8,
    /// Skip the enqueue if a matching pending or in-progress action exists.
    pub unique: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            group: String::new(),
            priority: DEFAULT_PRIORITY,
            unique: false,
        }
    }
}

impl EnqueueOptions {
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Where the next instance of a hook stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    At(DateTime<Utc>),
    /// An instance is executing right now.
    Running,
    NotScheduled,
}

/// Caller-facing API: builds actions from schedules and enqueues them.
///
/// Construct once at startup and share; it holds no state beyond the store.
pub struct ActionQueue {
    store: Arc<ActionStore>,
    timezone: Tz,
}

impl ActionQueue {
    /// `timezone` is applied to cron expressions enqueued without one.
    pub fn new(store: Arc<ActionStore>, timezone: Tz) -> Self {
        Self { store, timezone }
    }

    /// Like [`ActionQueue::new`], parsing an IANA timezone name.
    pub fn with_timezone_name(store: Arc<ActionStore>, timezone: &str) -> Result<Self> {
        let tz = timezone
            .parse::<Tz>()
            .map_err(|_| QueueError::InvalidSchedule(format!("unknown timezone '{timezone}'")))?;
        Ok(Self::new(store, tz))
    }

    pub fn store(&self) -> &Arc<ActionStore> {
        &self.store
    }

    /// Run as soon as a runner picks it up.
    pub fn enqueue_async(
        &self,
        hook: &str,
        args: ActionArgs,
        opts: &EnqueueOptions,
    ) -> Result<Option<ActionId>> {
        self.enqueue(hook, args, Schedule::Null, opts)
    }

    pub fn schedule_single(
        &self,
        at: DateTime<Utc>,
        hook: &str,
        args: ActionArgs,
        opts: &EnqueueOptions,
    ) -> Result<Option<ActionId>> {
        self.enqueue(hook, args, Schedule::single(at), opts)
    }

    /// First run at `first`, then every `interval_secs` on the same cadence.
    pub fn schedule_recurring(
        &self,
        first: DateTime<Utc>,
        interval_secs: i64,
        hook: &str,
        args: ActionArgs,
        opts: &EnqueueOptions,
    ) -> Result<Option<ActionId>> {
        let schedule = Schedule::interval(first, interval_secs)?;
        self.enqueue(hook, args, schedule, opts)
    }

    /// Cron schedule starting no earlier than `first`, in `timezone` or the queue default.
    pub fn schedule_cron(
        &self,
        first: DateTime<Utc>,
        expression: &str,
        timezone: Option<&str>,
        hook: &str,
        args: ActionArgs,
        opts: &EnqueueOptions,
    ) -> Result<Option<ActionId>> {
        let cron = match timezone {
            Some(tz) => CronSpec::new(expression, tz)?,
            None => CronSpec::with_timezone(expression, self.timezone)?,
        };
        let schedule = Schedule::Cron { start: first, cron };
        self.enqueue(hook, args, schedule, opts)
    }

    fn enqueue(
        &self,
        hook: &str,
        args: ActionArgs,
        schedule: Schedule,
        opts: &EnqueueOptions,
    ) -> Result<Option<ActionId>> {
        let action = Action::new(hook, args, schedule)
            .with_group(opts.group.clone())
            .with_priority(opts.priority);
        let id = if opts.unique {
            self.store.save_unique_action(&action)?
        } else {
            Some(self.store.save_action(&action)?)
        };
        if let Some(id) = id {
            info!(action_id = %id, hook, group = %opts.group, "action enqueued");
        }
        Ok(id)
    }

    /// When the next matching instance runs.
    pub fn next_scheduled(
        &self,
        hook: &str,
        args: Option<&ActionArgs>,
        group: Option<&str>,
    ) -> Result<NextRun> {
        let mut params = FindParams {
            args: args.cloned(),
            status: Some(ActionStatus::Pending),
            group: group.map(str::to_string),
        };
        if let Some(id) = self.store.find_action(hook, &params)? {
            return Ok(NextRun::At(self.store.get_date(id)?));
        }
        params.status = Some(ActionStatus::InProgress);
        if self.store.find_action(hook, &params)?.is_some() {
            return Ok(NextRun::Running);
        }
        Ok(NextRun::NotScheduled)
    }

    /// Whether any matching instance is pending or running.
    pub fn has_scheduled(
        &self,
        hook: &str,
        args: Option<&ActionArgs>,
        group: Option<&str>,
    ) -> Result<bool> {
        let query = ActionQuery {
            hook: Some(hook.to_string()),
            args: args.cloned(),
            group: group.map(str::to_string),
            statuses: vec![ActionStatus::Pending, ActionStatus::InProgress],
            ..ActionQuery::default()
        };
        Ok(self.store.count_actions(&query)? > 0)
    }

    /// Cancel the next pending matching instance. Returns its id, if any.
    pub fn unschedule(
        &self,
        hook: &str,
        args: Option<&ActionArgs>,
        group: Option<&str>,
    ) -> Result<Option<ActionId>> {
        let params = FindParams {
            args: args.cloned(),
            status: Some(ActionStatus::Pending),
            group: group.map(str::to_string),
        };
        let Some(id) = self.store.find_action(hook, &params)? else {
            return Ok(None);
        };
        self.store.cancel_action(id)?;
        info!(action_id = %id, hook, "action unscheduled");
        Ok(Some(id))
    }

    /// Cancel every pending matching instance.
    pub fn unschedule_all(
        &self,
        hook: &str,
        args: Option<&ActionArgs>,
        group: Option<&str>,
    ) -> Result<usize> {
        let n = self.store.cancel_by_hook(hook, args, group)?;
        info!(count = n, hook, "actions unscheduled");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use rusqlite::Connection;

    fn queue() -> ActionQueue {
        let store = Arc::new(ActionStore::new(Connection::open_in_memory().unwrap()).unwrap());
        ActionQueue::new(store, chrono_tz::UTC)
    }

    #[test]
    fn enqueue_variants_persist_schedules() {
        let q = queue();
        let opts = EnqueueOptions::default().group("g").priority(4);
        let at = Utc::now() + TimeDelta::hours(1);

        let async_id = q.enqueue_async("a", ActionArgs::new(), &opts).unwrap().unwrap();
        let single_id = q.schedule_single(at, "b", ActionArgs::new(), &opts).unwrap().unwrap();
        let rec_id = q
            .schedule_recurring(at, 600, "c", ActionArgs::new(), &opts)
            .unwrap()
            .unwrap();
        let cron_id = q
            .schedule_cron(at, "0 0 * * *", None, "d", ActionArgs::new(), &opts)
            .unwrap()
            .unwrap();

        let stored = q.store().fetch_action(async_id).unwrap();
        assert_eq!(stored.action.schedule, Schedule::Null);
        assert_eq!(stored.action.group, "g");
        assert_eq!(stored.action.priority, 4);

        assert!(!q.store().fetch_action(single_id).unwrap().action.is_recurring());
        assert!(q.store().fetch_action(rec_id).unwrap().action.is_recurring());
        match q.store().fetch_action(cron_id).unwrap().action.schedule {
            Schedule::Cron { cron, .. } => assert_eq!(cron.timezone(), chrono_tz::UTC),
            other => panic!("expected cron, got {other:?}"),
        }
    }

    #[test]
    fn malformed_schedules_persist_nothing() {
        let q = queue();
        let now = Utc::now();
        let opts = EnqueueOptions::default();
        assert!(q.schedule_recurring(now, 0, "x", ActionArgs::new(), &opts).is_err());
        assert!(q.schedule_recurring(now, -5, "x", ActionArgs::new(), &opts).is_err());
        assert!(q
            .schedule_cron(now, "bogus", None, "x", ActionArgs::new(), &opts)
            .is_err());
        assert!(q
            .schedule_cron(now, "* * * * *", Some("Nowhere/Land"), "x", ActionArgs::new(), &opts)
            .is_err());
        assert_eq!(q.store().count_actions(&ActionQuery::default()).unwrap(), 0);
    }

    #[test]
    fn unique_enqueue_is_skipped_while_pending() {
        let q = queue();
        let opts = EnqueueOptions::default().unique();
        let args = ActionArgs::new().with("order", 9);
        assert!(q.enqueue_async("ship", args.clone(), &opts).unwrap().is_some());
        assert!(q.enqueue_async("ship", args.clone(), &opts).unwrap().is_none());
        // Without the flag duplicates are allowed.
        assert!(q
            .enqueue_async("ship", args, &EnqueueOptions::default())
            .unwrap()
            .is_some());
    }

    #[test]
    fn next_scheduled_reports_state() {
        let q = queue();
        let opts = EnqueueOptions::default();
        assert_eq!(q.next_scheduled("tick", None, None).unwrap(), NextRun::NotScheduled);

        let at = db_time(Utc::now() + TimeDelta::minutes(10));
        let id = q.schedule_single(at, "tick", ActionArgs::new(), &opts).unwrap().unwrap();
        assert_eq!(q.next_scheduled("tick", None, None).unwrap(), NextRun::At(at));
        assert!(q.has_scheduled("tick", None, None).unwrap());
        assert!(!q.has_scheduled("tick", None, Some("other")).unwrap());

        q.store().log_execution(id).unwrap();
        assert_eq!(q.next_scheduled("tick", None, None).unwrap(), NextRun::Running);
        assert!(q.has_scheduled("tick", None, None).unwrap());

        q.store().mark_complete(id).unwrap();
        assert_eq!(q.next_scheduled("tick", None, None).unwrap(), NextRun::NotScheduled);
        assert!(!q.has_scheduled("tick", None, None).unwrap());
    }

    #[test]
    fn unschedule_cancels_next_then_all() {
        let q = queue();
        let opts = EnqueueOptions::default();
        let now = Utc::now();
        let first = q
            .schedule_single(now + TimeDelta::minutes(1), "report", ActionArgs::new(), &opts)
            .unwrap()
            .unwrap();
        let second = q
            .schedule_single(now + TimeDelta::minutes(2), "report", ActionArgs::new(), &opts)
            .unwrap()
            .unwrap();
        let third = q
            .schedule_single(now + TimeDelta::minutes(3), "report", ActionArgs::new(), &opts)
            .unwrap()
            .unwrap();

        assert_eq!(q.unschedule("report", None, None).unwrap(), Some(first));
        assert_eq!(q.store().get_status(first).unwrap(), ActionStatus::Canceled);
        assert_eq!(q.store().get_status(second).unwrap(), ActionStatus::Pending);

        assert_eq!(q.unschedule_all("report", None, None).unwrap(), 2);
        assert_eq!(q.store().get_status(third).unwrap(), ActionStatus::Canceled);
        assert_eq!(q.unschedule("report", None, None).unwrap(), None);
    }

    fn db_time(at: DateTime<Utc>) -> DateTime<Utc> {
        crate::db::truncate(at)
    }
}
