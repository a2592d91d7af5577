use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the queue schema in `conn`.
///
/// Creates the `actions` and `queue_locks` tables (idempotent) plus the
/// indexes the claim, lookup and housekeeping queries rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS actions (
            action_id     INTEGER PRIMARY KEY AUTOINCREMENT,
            hook          TEXT    NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'pending',
            scheduled_at  TEXT    NOT NULL,   -- RFC 3339 UTC, second precision
            priority      INTEGER NOT NULL DEFAULT 10,
            args          TEXT    NOT NULL,   -- JSON object, insertion order
            args_key      TEXT    NOT NULL,   -- canonical JSON for equality lookups
            schedule      TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            group_slug    TEXT    NOT NULL DEFAULT '',
            attempts      INTEGER NOT NULL DEFAULT 0,
            last_attempt  TEXT,
            claim_id      TEXT,               -- NULL when unclaimed
            created_at    TEXT    NOT NULL,
            updated_at    TEXT    NOT NULL
        ) STRICT;

        -- Claim staking: WHERE status = 'pending' AND claim_id IS NULL AND scheduled_at <= ?
        CREATE INDEX IF NOT EXISTS idx_actions_claimable
            ON actions (status, claim_id, priority, attempts, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_actions_hook_status ON actions (hook, status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_actions_claim_id ON actions (claim_id);
        CREATE INDEX IF NOT EXISTS idx_actions_group ON actions (group_slug);

        CREATE TABLE IF NOT EXISTS queue_locks (
            lock_type   TEXT NOT NULL PRIMARY KEY,
            expires_at  TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Open a file-backed connection tuned for several concurrent runners.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Fixed-width text form used for every timestamp column, so text order is time order.
pub fn to_sql_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn from_sql_time(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc))
}

/// Drop sub-second precision, matching what the columns can hold.
pub fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('actions', 'queue_locks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn sql_time_sorts_lexicographically() {
        let a = Utc.with_ymd_and_hms(2024, 9, 1, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(to_sql_time(a), "2024-09-01T23:59:59Z");
        assert!(to_sql_time(a) < to_sql_time(b));
        assert_eq!(from_sql_time(&to_sql_time(b)).unwrap(), b);
    }
}
