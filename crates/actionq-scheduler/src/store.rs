use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, instrument, warn};

use actionq_core::ActionArgs;

use crate::db::{self, from_sql_time, init_db, to_sql_time, truncate};
use crate::error::{QueueError, Result};
use crate::types::{
    Action, ActionId, ActionQuery, ActionStatus, Claim, ClaimFilter, ClaimId, FindParams,
    SortOrder, StoredAction,
};

const COLUMNS: &str = "action_id, hook, status, scheduled_at, priority, args, schedule,
                       group_slug, attempts, last_attempt, claim_id, created_at, updated_at";

/// Execution order inside a claim. Load-bearing: runners iterate in exactly this order.
const CLAIM_ORDER: &str = "priority ASC, attempts ASC, scheduled_at ASC, action_id ASC";

/// SQLite-backed action store and claiming engine.
///
/// Every operation touching `status` or `claim_id` is a single conditional
/// statement, so concurrent runners holding their own `ActionStore` over the
/// same database file cannot both win the same row.
pub struct ActionStore {
    db: Mutex<Connection>,
}

impl ActionStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Self::new(db::open(path, busy_timeout)?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic elsewhere cannot leave the connection itself inconsistent.
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- persistence --------------------------------------------------------

    /// Persist a new pending action due at its schedule's first run (or now).
    #[instrument(skip(self, action), fields(hook = %action.hook))]
    pub fn save_action(&self, action: &Action) -> Result<ActionId> {
        let at = action.schedule.first_run().unwrap_or_else(Utc::now);
        self.save_action_at(action, at)
    }

    /// Persist a new pending action due at `scheduled_at`.
    ///
    /// Used for recurring successors, which keep their schedule's anchor but
    /// are due at a later occurrence.
    pub fn save_action_at(&self, action: &Action, scheduled_at: DateTime<Utc>) -> Result<ActionId> {
        validate(action)?;
        let conn = self.conn();
        let id = insert_action(&conn, action, scheduled_at)?;
        debug!(action_id = %id, hook = %action.hook, "action saved");
        Ok(id)
    }

    /// Persist `action` unless a pending or in-progress action with the same
    /// hook, arguments and group already exists. Returns `None` when skipped.
    #[instrument(skip(self, action), fields(hook = %action.hook))]
    pub fn save_unique_action(&self, action: &Action) -> Result<Option<ActionId>> {
        validate(action)?;
        let at = action.schedule.first_run().unwrap_or_else(Utc::now);
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front so the check and the insert
        // cannot interleave with another process doing the same.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM actions
                 WHERE hook = ?1 AND args_key = ?2 AND group_slug = ?3
                   AND status IN ('pending', 'in-progress'))",
            params![action.hook, action.args.canonical(), action.group],
            |row| row.get(0),
        )?;
        if exists {
            debug!("duplicate action already queued, skipping");
            return Ok(None);
        }
        let id = insert_action(&tx, action, at)?;
        tx.commit()?;
        debug!(action_id = %id, "unique action saved");
        Ok(Some(id))
    }

    pub fn fetch_action(&self, id: ActionId) -> Result<StoredAction> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM actions WHERE action_id = ?1"),
            [id],
            row_to_action,
        )
        .optional()?
        .ok_or(QueueError::ActionNotFound { id })
    }

    /// Best single match for `hook`: the earliest scheduled when looking for
    /// pending work (the default), the most recent for any other status.
    pub fn find_action(&self, hook: &str, params: &FindParams) -> Result<Option<ActionId>> {
        let status = params.status.unwrap_or(ActionStatus::Pending);
        let order = if status == ActionStatus::Pending {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        };
        let query = ActionQuery {
            hook: Some(hook.to_string()),
            args: params.args.clone(),
            group: params.group.clone(),
            statuses: vec![status],
            order,
            limit: Some(1),
            ..ActionQuery::default()
        };
        Ok(self.query_actions(&query)?.into_iter().next())
    }

    pub fn query_actions(&self, query: &ActionQuery) -> Result<Vec<ActionId>> {
        let mut filter = query_filter(query);
        let direction = match query.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let mut sql = format!(
            "SELECT action_id FROM actions WHERE {}
             ORDER BY scheduled_at {direction}, action_id {direction}",
            filter.sql()
        );
        // SQLite requires LIMIT before OFFSET; -1 means unbounded.
        sql.push_str(" LIMIT ? OFFSET ?");
        filter.params.push(Value::Integer(
            query.limit.map(|l| l as i64).unwrap_or(-1),
        ));
        filter.params.push(Value::Integer(query.offset as i64));

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(filter.params), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<ActionId>>>()?;
        Ok(ids)
    }

    pub fn count_actions(&self, query: &ActionQuery) -> Result<u64> {
        let filter = query_filter(query);
        let conn = self.conn();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM actions WHERE {}", filter.sql()),
            params_from_iter(filter.params),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of actions in each status. Statuses with no actions are omitted.
    pub fn action_counts(&self) -> Result<BTreeMap<ActionStatus, u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM actions GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, ActionStatus>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(counts)
    }

    pub fn get_status(&self, id: ActionId) -> Result<ActionStatus> {
        let conn = self.conn();
        current_status(&conn, id)
    }

    pub fn get_claim_id(&self, id: ActionId) -> Result<Option<ClaimId>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT claim_id FROM actions WHERE action_id = ?1",
            [id],
            |row| row.get::<_, Option<ClaimId>>(0),
        )
        .optional()?
        .ok_or(QueueError::ActionNotFound { id })
    }

    /// Scheduled time for pending actions; last attempt once execution has begun.
    pub fn get_date(&self, id: ActionId) -> Result<DateTime<Utc>> {
        let action = self.fetch_action(id)?;
        Ok(match action.status {
            ActionStatus::Pending => action.scheduled_at,
            _ => action.last_attempt.unwrap_or(action.scheduled_at),
        })
    }

    pub fn delete_action(&self, id: ActionId) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM actions WHERE action_id = ?1", [id])?;
        if n == 0 {
            return Err(QueueError::ActionNotFound { id });
        }
        debug!(action_id = %id, "action deleted");
        Ok(())
    }

    // --- status transitions --------------------------------------------------

    /// pending → in-progress, bumping the attempt counter.
    ///
    /// Fails with `InvalidTransition` when another runner already started it.
    #[instrument(skip(self))]
    pub fn log_execution(&self, id: ActionId) -> Result<()> {
        self.transition(
            id,
            ActionStatus::InProgress,
            &[ActionStatus::Pending],
            ", attempts = attempts + 1, last_attempt = ?2",
        )
    }

    /// Terminal success. Rejected for actions that already finished.
    #[instrument(skip(self))]
    pub fn mark_complete(&self, id: ActionId) -> Result<()> {
        self.transition(
            id,
            ActionStatus::Complete,
            &[ActionStatus::Pending, ActionStatus::InProgress],
            ", last_attempt = ?2",
        )
    }

    /// Terminal failure. Rejected for actions that already finished.
    #[instrument(skip(self))]
    pub fn mark_failure(&self, id: ActionId) -> Result<()> {
        self.transition(
            id,
            ActionStatus::Failed,
            &[ActionStatus::Pending, ActionStatus::InProgress],
            ", last_attempt = ?2",
        )
    }

    #[instrument(skip(self))]
    pub fn cancel_action(&self, id: ActionId) -> Result<()> {
        self.transition(
            id,
            ActionStatus::Canceled,
            &[ActionStatus::Pending, ActionStatus::InProgress],
            "",
        )
    }

    /// Cancel every pending action for `hook`, optionally narrowed by args and group.
    pub fn cancel_by_hook(
        &self,
        hook: &str,
        args: Option<&ActionArgs>,
        group: Option<&str>,
    ) -> Result<usize> {
        self.cancel_pending(Some(hook), args, group)
    }

    /// Cancel every pending action in `group`.
    pub fn cancel_by_group(&self, group: &str) -> Result<usize> {
        self.cancel_pending(None, None, Some(group))
    }

    fn cancel_pending(
        &self,
        hook: Option<&str>,
        args: Option<&ActionArgs>,
        group: Option<&str>,
    ) -> Result<usize> {
        let now = to_sql_time(Utc::now());
        let mut filter = Filter::default();
        filter.raw("status = 'pending'");
        if let Some(hook) = hook {
            filter.cmp("hook", "=", hook);
        }
        if let Some(args) = args {
            filter.cmp("args_key", "=", args.canonical());
        }
        if let Some(group) = group {
            filter.cmp("group_slug", "=", group);
        }
        let mut values = vec![Value::Text(now)];
        values.append(&mut filter.params);
        let conn = self.conn();
        let n = conn.execute(
            &format!(
                "UPDATE actions SET status = 'canceled', updated_at = ? WHERE {}",
                filter.clauses.join(" AND ")
            ),
            params_from_iter(values),
        )?;
        debug!(count = n, hook, group, "pending actions canceled");
        Ok(n)
    }

    /// Move `id` to `to` if it is currently in one of `from`, in one statement.
    ///
    /// `set_extra` may reference `?2`, bound to the current time.
    fn transition(
        &self,
        id: ActionId,
        to: ActionStatus,
        from: &[ActionStatus],
        set_extra: &str,
    ) -> Result<()> {
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let now = to_sql_time(Utc::now());
        let conn = self.conn();
        let changed = conn.execute(
            &format!(
                "UPDATE actions SET status = ?1, updated_at = ?2{set_extra}
                 WHERE action_id = ?3 AND status IN ({allowed})"
            ),
            params![to, now, id],
        )?;
        if changed == 0 {
            // Only classify the failure; the update itself already decided it.
            return Err(match current_status(&conn, id) {
                Ok(current) => QueueError::InvalidTransition {
                    id,
                    from: current,
                    to,
                },
                Err(e) => e,
            });
        }
        debug!(action_id = %id, status = %to, "action status changed");
        Ok(())
    }

    // --- claims ----------------------------------------------------------------

    /// Atomically claim up to `limit` pending actions due at or before `before`
    /// (default now), in priority, attempts, scheduled time, id order.
    #[instrument(skip(self))]
    pub fn stake_claim(
        &self,
        limit: usize,
        before: Option<DateTime<Utc>>,
        filter: &ClaimFilter,
    ) -> Result<Claim> {
        let id = ClaimId::generate();
        let now = Utc::now();
        let before = truncate(before.unwrap_or(now));
        if limit == 0 {
            return Ok(Claim {
                id,
                action_ids: Vec::new(),
            });
        }

        let due = due_filter(before, filter);
        let now_str = to_sql_time(now);
        let mut values = vec![
            Value::Text(id.as_str().to_string()),
            Value::Text(now_str.clone()),
            Value::Text(now_str),
        ];
        values.extend(due.params.iter().cloned());
        values.push(Value::Integer(limit as i64));

        let conn = self.conn();
        // One statement: the subquery's `claim_id IS NULL` is checked and the
        // new claim written under SQLite's single writer lock.
        let staked = conn.execute(
            &format!(
                "UPDATE actions SET claim_id = ?, last_attempt = ?, updated_at = ?
                 WHERE action_id IN (
                     SELECT action_id FROM actions WHERE {}
                     ORDER BY {CLAIM_ORDER} LIMIT ?)
                 AND claim_id IS NULL AND status = 'pending'",
                due.sql()
            ),
            params_from_iter(values),
        )?;
        let action_ids = claimed_ids(&conn, &id, before)?;
        debug!(claim_id = %id, staked, claimed = action_ids.len(), "claim staked");
        Ok(Claim { id, action_ids })
    }

    /// Ids still tagged with `claim`, in execution order, excluding any that are
    /// not yet due (those are unclaimed).
    pub fn find_actions_by_claim(&self, claim: &ClaimId) -> Result<Vec<ActionId>> {
        let conn = self.conn();
        claimed_ids(&conn, claim, truncate(Utc::now()))
    }

    /// Clear the claim marker on every action still tagged with this claim.
    #[instrument(skip(self), fields(claim_id = %claim.id))]
    pub fn release_claim(&self, claim: &Claim) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE actions SET claim_id = NULL WHERE claim_id = ?1",
            [&claim.id],
        )?;
        debug!(released = n, "claim released");
        Ok(n)
    }

    pub fn unclaim_action(&self, id: ActionId) -> Result<()> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE actions SET claim_id = NULL WHERE action_id = ?1",
            [id],
        )?;
        if n == 0 {
            return Err(QueueError::ActionNotFound { id });
        }
        Ok(())
    }

    /// Distinct outstanding claims over non-terminal actions.
    pub fn get_claim_count(&self) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT claim_id) FROM actions
             WHERE claim_id IS NOT NULL AND status IN ('pending', 'in-progress')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// How many unclaimed pending actions a claim with `filter` could capture.
    pub fn count_due(&self, before: Option<DateTime<Utc>>, filter: &ClaimFilter) -> Result<u64> {
        let due = due_filter(truncate(before.unwrap_or_else(Utc::now)), filter);
        let conn = self.conn();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM actions WHERE {}", due.sql()),
            params_from_iter(due.params),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- history and housekeeping ----------------------------------------------

    /// Statuses of the `limit` most recently scheduled finished (complete or
    /// failed) actions for `hook`, newest first, whatever their arguments.
    pub fn recent_outcomes(&self, hook: &str, limit: usize) -> Result<Vec<ActionStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status FROM actions
             WHERE hook = ?1 AND status IN ('complete', 'failed')
             ORDER BY scheduled_at DESC, action_id DESC
             LIMIT ?2",
        )?;
        let statuses = stmt
            .query_map(params![hook, limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<ActionStatus>>>()?;
        Ok(statuses)
    }

    /// Release claims on pending actions claimed at or before `cutoff`.
    pub fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE actions SET claim_id = NULL
             WHERE status = 'pending' AND claim_id IS NOT NULL AND last_attempt <= ?1",
            [to_sql_time(cutoff)],
        )?;
        Ok(n)
    }

    /// Fail in-progress actions whose execution began at or before `cutoff`.
    pub fn fail_stale_in_progress(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let now = to_sql_time(Utc::now());
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE actions SET status = 'failed', claim_id = NULL, updated_at = ?1
             WHERE status = 'in-progress' AND last_attempt <= ?2",
            params![now, to_sql_time(cutoff)],
        )?;
        Ok(n)
    }

    /// Delete up to `limit` complete or canceled actions last touched at or before `cutoff`.
    pub fn delete_finished(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let conn = self.conn();
        let n = conn.execute(
            "DELETE FROM actions WHERE action_id IN (
                 SELECT action_id FROM actions
                 WHERE status IN ('complete', 'canceled') AND updated_at <= ?1
                 ORDER BY updated_at ASC, action_id ASC
                 LIMIT ?2)",
            params![to_sql_time(cutoff), limit as i64],
        )?;
        Ok(n)
    }

    /// Count of pending actions scheduled at or before `cutoff`, and the oldest one's time.
    pub fn past_due(&self, cutoff: DateTime<Utc>) -> Result<(u64, Option<DateTime<Utc>>)> {
        let conn = self.conn();
        let (count, oldest): (i64, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MIN(scheduled_at) FROM actions
             WHERE status = 'pending' AND scheduled_at <= ?1",
            [to_sql_time(cutoff)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let oldest = oldest
            .map(|raw| from_sql_time(&raw))
            .transpose()
            .map_err(|e| {
                QueueError::Database(rusqlite::Error::FromSqlConversionFailure(
                    1,
                    Type::Text,
                    Box::new(e),
                ))
            })?;
        Ok((count as u64, oldest))
    }
}

// --- private helpers ---------------------------------------------------------

fn validate(action: &Action) -> Result<()> {
    if action.hook.trim().is_empty() {
        return Err(QueueError::InvalidAction("hook name must not be empty".into()));
    }
    Ok(())
}

fn insert_action(conn: &Connection, action: &Action, scheduled_at: DateTime<Utc>) -> Result<ActionId> {
    let now = to_sql_time(Utc::now());
    let args = action.args.to_json()?;
    let schedule = serde_json::to_string(&action.schedule)?;
    conn.execute(
        "INSERT INTO actions
         (hook, status, scheduled_at, priority, args, args_key, schedule,
          group_slug, attempts, last_attempt, claim_id, created_at, updated_at)
         VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, NULL, ?8, ?8)",
        params![
            action.hook,
            to_sql_time(scheduled_at),
            action.priority,
            args,
            action.args.canonical(),
            schedule,
            action.group,
            now,
        ],
    )?;
    Ok(ActionId(conn.last_insert_rowid()))
}

fn current_status(conn: &Connection, id: ActionId) -> Result<ActionStatus> {
    conn.query_row(
        "SELECT status FROM actions WHERE action_id = ?1",
        [id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or(QueueError::ActionNotFound { id })
}

fn claimed_ids(conn: &Connection, claim: &ClaimId, before: DateTime<Utc>) -> Result<Vec<ActionId>> {
    let rows: Vec<(ActionId, DateTime<Utc>)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT action_id, scheduled_at FROM actions
             WHERE claim_id = ?1 ORDER BY {CLAIM_ORDER}"
        ))?;
        let rows = stmt
            .query_map([claim], |row| Ok((row.get(0)?, time_column(row, 1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut due = Vec::with_capacity(rows.len());
    for (id, scheduled_at) in rows {
        if scheduled_at <= before {
            due.push(id);
            continue;
        }
        // Never run ahead of schedule, whatever the staking statement did.
        warn!(action_id = %id, claim_id = %claim, %scheduled_at, "claimed action not yet due, unclaiming");
        conn.execute(
            "UPDATE actions SET claim_id = NULL WHERE action_id = ?1 AND claim_id = ?2",
            params![id, claim],
        )?;
    }
    Ok(due)
}

fn row_to_action(row: &Row<'_>) -> rusqlite::Result<StoredAction> {
    let args: String = row.get(5)?;
    let schedule: String = row.get(6)?;
    Ok(StoredAction {
        id: row.get(0)?,
        action: Action {
            hook: row.get(1)?,
            args: ActionArgs::from_json(&args).map_err(|e| conversion_error(5, e))?,
            schedule: serde_json::from_str(&schedule).map_err(|e| conversion_error(6, e))?,
            group: row.get(7)?,
            priority: row.get(4)?,
        },
        status: row.get(2)?,
        scheduled_at: time_column(row, 3)?,
        attempts: row.get(8)?,
        last_attempt: row
            .get::<_, Option<String>>(9)?
            .map(|raw| from_sql_time(&raw).map_err(|e| conversion_error(9, e)))
            .transpose()?,
        claim_id: row.get(10)?,
        created_at: time_column(row, 11)?,
        updated_at: time_column(row, 12)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_sql_time(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// `WHERE` clauses with positional parameters, joined with `AND`.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    fn raw(&mut self, clause: &str) {
        self.clauses.push(clause.to_string());
    }

    fn cmp(&mut self, column: &str, op: &str, value: impl Into<String>) {
        self.clauses.push(format!("{column} {op} ?"));
        self.params.push(Value::Text(value.into()));
    }

    fn any_of(&mut self, column: &str, values: &[String], negate: bool) {
        if values.is_empty() {
            return;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let op = if negate { "NOT IN" } else { "IN" };
        self.clauses.push(format!("{column} {op} ({placeholders})"));
        self.params
            .extend(values.iter().map(|v| Value::Text(v.clone())));
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses.join(" AND ")
        }
    }
}

/// Unclaimed pending actions due at or before `before` that match `filter`.
fn due_filter(before: DateTime<Utc>, filter: &ClaimFilter) -> Filter {
    let mut due = Filter::default();
    due.raw("status = 'pending'");
    due.raw("claim_id IS NULL");
    due.cmp("scheduled_at", "<=", to_sql_time(before));
    due.any_of("hook", &filter.hooks, false);
    due.any_of("group_slug", &filter.groups, false);
    due.any_of("group_slug", &filter.exclude_groups, true);
    due
}

fn query_filter(query: &ActionQuery) -> Filter {
    let mut filter = Filter::default();
    if let Some(ref hook) = query.hook {
        filter.cmp("hook", "=", hook.as_str());
    }
    if let Some(ref args) = query.args {
        filter.cmp("args_key", "=", args.canonical());
    }
    if let Some(ref group) = query.group {
        filter.cmp("group_slug", "=", group.as_str());
    }
    let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();
    filter.any_of("status", &statuses, false);
    match query.claimed {
        Some(true) => filter.raw("claim_id IS NOT NULL"),
        Some(false) => filter.raw("claim_id IS NULL"),
        None => {}
    }
    if let Some(before) = query.scheduled_before {
        filter.cmp("scheduled_at", "<=", to_sql_time(before));
    }
    if let Some(after) = query.scheduled_after {
        filter.cmp("scheduled_at", ">", to_sql_time(after));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Schedule;
    use chrono::TimeDelta;

    fn store() -> ActionStore {
        ActionStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn ago(secs: i64) -> DateTime<Utc> {
        Utc::now() - TimeDelta::seconds(secs)
    }

    fn single(hook: &str, at: DateTime<Utc>) -> Action {
        Action::new(hook, ActionArgs::new(), Schedule::single(at))
    }

    #[test]
    fn save_and_fetch() {
        let store = store();
        let at = truncate(ago(60));
        let action = Action::new(
            "send_report",
            ActionArgs::new().with("user", 42),
            Schedule::single(at),
        )
        .with_group("reports")
        .with_priority(3);
        let id = store.save_action(&action).unwrap();

        let stored = store.fetch_action(id).unwrap();
        assert_eq!(stored.action, action);
        assert_eq!(stored.status, ActionStatus::Pending);
        assert_eq!(stored.scheduled_at, at);
        assert_eq!(stored.attempts, 0);
        assert!(stored.claim_id.is_none());
        assert!(stored.is_executable());
    }

    #[test]
    fn null_schedule_is_due_immediately() {
        let store = store();
        let id = store
            .save_action(&Action::new("now", ActionArgs::new(), Schedule::Null))
            .unwrap();
        assert!(store.fetch_action(id).unwrap().scheduled_at <= Utc::now());
        assert_eq!(store.count_due(None, &ClaimFilter::default()).unwrap(), 1);
    }

    #[test]
    fn empty_hook_is_rejected() {
        let store = store();
        let err = store.save_action(&single("  ", ago(1))).unwrap_err();
        assert_eq!(err.code(), "INVALID_ACTION");
    }

    #[test]
    fn fetch_missing_is_not_found() {
        let store = store();
        assert!(matches!(
            store.fetch_action(ActionId(999)),
            Err(QueueError::ActionNotFound { id: ActionId(999) })
        ));
    }

    #[test]
    fn stake_claim_respects_limit_and_does_not_overlap() {
        let store = store();
        let ids: Vec<ActionId> = (0..5)
            .map(|i| store.save_action(&single("job", ago(100 - i))).unwrap())
            .collect();

        let first = store.stake_claim(3, None, &ClaimFilter::default()).unwrap();
        assert_eq!(first.action_ids, ids[..3].to_vec());
        for id in &first.action_ids {
            assert_eq!(store.get_claim_id(*id).unwrap(), Some(first.id.clone()));
        }

        let second = store.stake_claim(3, None, &ClaimFilter::default()).unwrap();
        assert_eq!(second.action_ids, ids[3..].to_vec());
        assert_ne!(first.id, second.id);
        assert_eq!(store.get_claim_count().unwrap(), 2);
    }

    #[test]
    fn claim_order_is_priority_then_attempts() {
        let store = store();
        let a = store.save_action(&single("a", ago(30)).with_priority(5)).unwrap();
        let b = store.save_action(&single("b", ago(60)).with_priority(5)).unwrap();
        let c = store.save_action(&single("c", ago(10)).with_priority(2)).unwrap();
        // Give B two prior attempts.
        store
            .conn()
            .execute("UPDATE actions SET attempts = 2 WHERE action_id = ?1", [b])
            .unwrap();

        let claim = store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        assert_eq!(claim.action_ids, vec![c, a, b]);
    }

    #[test]
    fn ties_break_on_scheduled_time_then_id() {
        let store = store();
        let at = ago(100);
        let first = store.save_action(&single("x", at)).unwrap();
        let second = store.save_action(&single("x", at)).unwrap();
        let earlier = store.save_action(&single("x", ago(200))).unwrap();
        let claim = store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        assert_eq!(claim.action_ids, vec![earlier, first, second]);
    }

    #[test]
    fn future_actions_are_not_claimed() {
        let store = store();
        let past = store.save_action(&single("due", ago(10))).unwrap();
        store
            .save_action(&single("later", Utc::now() + TimeDelta::hours(1)))
            .unwrap();
        let claim = store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        assert_eq!(claim.action_ids, vec![past]);

        // An explicit horizon picks up the later one.
        let later = store
            .stake_claim(10, Some(Utc::now() + TimeDelta::hours(2)), &ClaimFilter::default())
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn claim_filters_restrict_hooks_and_groups() {
        let store = store();
        let billing = store.save_action(&single("invoice", ago(5)).with_group("billing")).unwrap();
        let mail = store.save_action(&single("email", ago(5)).with_group("mail")).unwrap();
        let loose = store.save_action(&single("email", ago(5))).unwrap();

        let by_hook = store
            .stake_claim(10, None, &ClaimFilter::default().hooks(["invoice"]))
            .unwrap();
        assert_eq!(by_hook.action_ids, vec![billing]);
        store.release_claim(&by_hook).unwrap();

        let by_group = store
            .stake_claim(10, None, &ClaimFilter::default().groups(["mail"]))
            .unwrap();
        assert_eq!(by_group.action_ids, vec![mail]);
        store.release_claim(&by_group).unwrap();

        let excluding = store
            .stake_claim(10, None, &ClaimFilter::default().exclude_groups(["billing", "mail"]))
            .unwrap();
        assert_eq!(excluding.action_ids, vec![loose]);
    }

    #[test]
    fn release_only_touches_its_own_claim() {
        let store = store();
        for i in 0..4 {
            store.save_action(&single("job", ago(50 - i))).unwrap();
        }
        let first = store.stake_claim(2, None, &ClaimFilter::default()).unwrap();
        let second = store.stake_claim(2, None, &ClaimFilter::default()).unwrap();

        assert_eq!(store.release_claim(&first).unwrap(), 2);
        for id in &first.action_ids {
            assert_eq!(store.get_claim_id(*id).unwrap(), None);
        }
        for id in &second.action_ids {
            assert_eq!(store.get_claim_id(*id).unwrap(), Some(second.id.clone()));
        }
        // Releasing again is a no-op.
        assert_eq!(store.release_claim(&first).unwrap(), 0);
    }

    #[test]
    fn not_yet_due_claimed_rows_are_filtered_and_unclaimed() {
        let store = store();
        let due = store.save_action(&single("job", ago(10))).unwrap();
        let early = store.save_action(&single("job", Utc::now() + TimeDelta::hours(1))).unwrap();
        let claim = store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        // Simulate the staking statement over-capturing.
        store
            .conn()
            .execute(
                "UPDATE actions SET claim_id = ?1 WHERE action_id = ?2",
                params![claim.id, early],
            )
            .unwrap();

        assert_eq!(store.find_actions_by_claim(&claim.id).unwrap(), vec![due]);
        assert_eq!(store.get_claim_id(early).unwrap(), None);
    }

    #[test]
    fn log_execution_is_single_shot() {
        let store = store();
        let id = store.save_action(&single("job", ago(1))).unwrap();
        store.log_execution(id).unwrap();
        let stored = store.fetch_action(id).unwrap();
        assert_eq!(stored.status, ActionStatus::InProgress);
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_attempt.is_some());

        // A second runner racing on the same id loses.
        assert!(matches!(
            store.log_execution(id),
            Err(QueueError::InvalidTransition {
                from: ActionStatus::InProgress,
                to: ActionStatus::InProgress,
                ..
            })
        ));
        assert_eq!(store.fetch_action(id).unwrap().attempts, 1);
    }

    #[test]
    fn terminal_states_reject_further_marks() {
        let store = store();
        let id = store.save_action(&single("job", ago(1))).unwrap();
        store.log_execution(id).unwrap();
        store.mark_complete(id).unwrap();

        let err = store.mark_failure(id).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: ActionStatus::Complete,
                to: ActionStatus::Failed,
                ..
            }
        ));
        assert!(store.mark_complete(id).is_err());
        assert!(store.cancel_action(id).is_err());
        assert_eq!(store.get_status(id).unwrap(), ActionStatus::Complete);
    }

    #[test]
    fn marks_on_missing_ids_are_not_found() {
        let store = store();
        for result in [
            store.mark_complete(ActionId(7)),
            store.mark_failure(ActionId(7)),
            store.log_execution(ActionId(7)),
            store.cancel_action(ActionId(7)),
            store.delete_action(ActionId(7)),
        ] {
            assert!(matches!(result, Err(QueueError::ActionNotFound { .. })));
        }
    }

    #[test]
    fn canceled_actions_are_not_claimable() {
        let store = store();
        let id = store.save_action(&single("job", ago(5))).unwrap();
        store.cancel_action(id).unwrap();
        assert_eq!(store.get_status(id).unwrap(), ActionStatus::Canceled);
        assert!(store.stake_claim(10, None, &ClaimFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn claim_count_ignores_finished_actions() {
        let store = store();
        let id = store.save_action(&single("job", ago(5))).unwrap();
        store.save_action(&single("job", ago(5))).unwrap();
        let claim = store.stake_claim(1, None, &ClaimFilter::default()).unwrap();
        assert_eq!(claim.action_ids, vec![id]);
        assert_eq!(store.get_claim_count().unwrap(), 1);

        store.log_execution(id).unwrap();
        assert_eq!(store.get_claim_count().unwrap(), 1);
        store.mark_complete(id).unwrap();
        assert_eq!(store.get_claim_count().unwrap(), 0);
    }

    #[test]
    fn find_action_prefers_next_pending_and_latest_finished() {
        let store = store();
        let args = ActionArgs::new().with("k", 1);
        let mk = |at| Action::new("sync", args.clone(), Schedule::single(at));
        let old_done = store.save_action(&mk(ago(300))).unwrap();
        let new_done = store.save_action(&mk(ago(200))).unwrap();
        let soon = store.save_action(&mk(Utc::now() + TimeDelta::minutes(5))).unwrap();
        store.save_action(&mk(Utc::now() + TimeDelta::minutes(50))).unwrap();
        store.mark_complete(old_done).unwrap();
        store.mark_complete(new_done).unwrap();

        assert_eq!(store.find_action("sync", &FindParams::default()).unwrap(), Some(soon));
        let complete = FindParams {
            status: Some(ActionStatus::Complete),
            ..FindParams::default()
        };
        assert_eq!(store.find_action("sync", &complete).unwrap(), Some(new_done));

        let other_args = FindParams {
            args: Some(ActionArgs::new().with("k", 2)),
            ..FindParams::default()
        };
        assert_eq!(store.find_action("sync", &other_args).unwrap(), None);
    }

    #[test]
    fn args_match_ignores_key_order() {
        let store = store();
        let stored = ActionArgs::new().with("a", 1).with("b", 2);
        let id = store
            .save_action(&Action::new("sync", stored, Schedule::Null))
            .unwrap();
        let lookup = FindParams {
            args: Some(ActionArgs::new().with("b", 2).with("a", 1)),
            ..FindParams::default()
        };
        assert_eq!(store.find_action("sync", &lookup).unwrap(), Some(id));
    }

    #[test]
    fn unique_save_skips_duplicates_until_finished() {
        let store = store();
        let action = Action::new("sync", ActionArgs::new().with("a", 1).with("b", 2), Schedule::Null);
        let reordered = Action::new("sync", ActionArgs::new().with("b", 2).with("a", 1), Schedule::Null);

        let id = store.save_unique_action(&action).unwrap().unwrap();
        assert_eq!(store.save_unique_action(&reordered).unwrap(), None);
        // A different group is a different action.
        assert!(store
            .save_unique_action(&action.clone().with_group("other"))
            .unwrap()
            .is_some());

        store.mark_complete(id).unwrap();
        assert!(store.save_unique_action(&action).unwrap().is_some());
    }

    #[test]
    fn query_and_count_actions() {
        let store = store();
        let a = store.save_action(&single("a", ago(30))).unwrap();
        let b = store.save_action(&single("a", ago(20))).unwrap();
        store.save_action(&single("b", ago(10))).unwrap();
        store.mark_failure(b).unwrap();

        let all_a = ActionQuery {
            hook: Some("a".into()),
            order: SortOrder::Desc,
            ..ActionQuery::default()
        };
        assert_eq!(store.query_actions(&all_a).unwrap(), vec![b, a]);
        assert_eq!(store.count_actions(&all_a).unwrap(), 2);

        let failed = ActionQuery {
            statuses: vec![ActionStatus::Failed],
            ..ActionQuery::default()
        };
        assert_eq!(store.query_actions(&failed).unwrap(), vec![b]);

        let paged = ActionQuery {
            limit: Some(1),
            offset: 1,
            ..ActionQuery::default()
        };
        assert_eq!(store.query_actions(&paged).unwrap(), vec![b]);

        let counts = store.action_counts().unwrap();
        assert_eq!(counts.get(&ActionStatus::Pending), Some(&2));
        assert_eq!(counts.get(&ActionStatus::Failed), Some(&1));
        assert_eq!(counts.get(&ActionStatus::Complete), None);
    }

    #[test]
    fn cancel_by_hook_and_group_only_touch_pending() {
        let store = store();
        let args = ActionArgs::new().with("id", 1);
        let p1 = store
            .save_action(&Action::new("sync", args.clone(), Schedule::Null))
            .unwrap();
        let p2 = store
            .save_action(&Action::new("sync", ActionArgs::new(), Schedule::Null))
            .unwrap();
        let done = store
            .save_action(&Action::new("sync", args.clone(), Schedule::Null))
            .unwrap();
        store.mark_complete(done).unwrap();
        let grouped = store
            .save_action(&Action::new("other", ActionArgs::new(), Schedule::Null).with_group("g"))
            .unwrap();

        assert_eq!(store.cancel_by_hook("sync", Some(&args), None).unwrap(), 1);
        assert_eq!(store.get_status(p1).unwrap(), ActionStatus::Canceled);
        assert_eq!(store.get_status(p2).unwrap(), ActionStatus::Pending);
        assert_eq!(store.get_status(done).unwrap(), ActionStatus::Complete);

        assert_eq!(store.cancel_by_group("g").unwrap(), 1);
        assert_eq!(store.get_status(grouped).unwrap(), ActionStatus::Canceled);
    }

    #[test]
    fn get_date_tracks_lifecycle() {
        let store = store();
        let at = truncate(ago(3600));
        let id = store.save_action(&single("job", at)).unwrap();
        assert_eq!(store.get_date(id).unwrap(), at);
        store.log_execution(id).unwrap();
        store.mark_complete(id).unwrap();
        assert!(store.get_date(id).unwrap() > at);
    }

    #[test]
    fn recent_outcomes_are_newest_first_across_args() {
        let store = store();
        for (i, fail) in [(0, false), (1, true), (2, true)] {
            let id = store
                .save_action(&Action::new(
                    "flaky",
                    ActionArgs::new().with("n", i),
                    Schedule::single(ago(300 - i * 10)),
                ))
                .unwrap();
            if fail {
                store.mark_failure(id).unwrap();
            } else {
                store.mark_complete(id).unwrap();
            }
        }
        store.save_action(&single("flaky", ago(1))).unwrap();

        assert_eq!(
            store.recent_outcomes("flaky", 5).unwrap(),
            vec![ActionStatus::Failed, ActionStatus::Failed, ActionStatus::Complete]
        );
        assert_eq!(store.recent_outcomes("flaky", 1).unwrap(), vec![ActionStatus::Failed]);
    }

    #[test]
    fn housekeeping_queries() {
        let store = store();
        let stale_claim = store.save_action(&single("a", ago(50))).unwrap();
        let stuck = store.save_action(&single("b", ago(50))).unwrap();
        let claim = store.stake_claim(10, None, &ClaimFilter::default()).unwrap();
        assert_eq!(claim.len(), 2);
        store.log_execution(stuck).unwrap();

        let future = Utc::now() + TimeDelta::seconds(5);
        assert_eq!(store.release_stale_claims(future).unwrap(), 1);
        assert_eq!(store.get_claim_id(stale_claim).unwrap(), None);

        assert_eq!(store.fail_stale_in_progress(future).unwrap(), 1);
        assert_eq!(store.get_status(stuck).unwrap(), ActionStatus::Failed);
        assert_eq!(store.get_claim_id(stuck).unwrap(), None);

        store.mark_complete(stale_claim).unwrap();
        // Failed actions are retained; complete ones are removed.
        assert_eq!(store.delete_finished(future, 10).unwrap(), 1);
        assert!(store.fetch_action(stale_claim).is_err());
        assert!(store.fetch_action(stuck).is_ok());
    }

    #[test]
    fn past_due_reports_count_and_oldest() {
        let store = store();
        let oldest = truncate(ago(7200));
        store.save_action(&single("a", oldest)).unwrap();
        store.save_action(&single("b", ago(3700))).unwrap();
        store.save_action(&single("c", ago(10))).unwrap();
        let (count, first) = store.past_due(ago(3600)).unwrap();
        assert_eq!(count, 2);
        assert_eq!(first, Some(oldest));
    }
}
