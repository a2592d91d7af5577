use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::db::{from_sql_time, init_db, to_sql_time};
use crate::error::{QueueError, Result};

/// Named, expiring locks shared through the database.
///
/// Used to make periodic work (such as housekeeping) run at most once per
/// period across every process pointed at the same file.
pub struct QueueLock {
    db: Mutex<Connection>,
}

impl QueueLock {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the `kind` lock for `ttl` if it is free or expired.
    ///
    /// Returns `false` while someone else holds it.
    pub fn set(&self, kind: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|e| QueueError::InvalidAction(format!("lock ttl out of range: {e}")))?;
        let expires = now
            .checked_add_signed(ttl)
            .map(to_sql_time)
            .ok_or_else(|| QueueError::InvalidAction("lock ttl out of range".into()))?;
        let conn = self.conn();
        // The conflict branch only fires when the current holder has expired.
        let changed = conn.execute(
            "INSERT INTO queue_locks (lock_type, expires_at) VALUES (?1, ?2)
             ON CONFLICT (lock_type) DO UPDATE SET expires_at = excluded.expires_at
             WHERE queue_locks.expires_at <= ?3",
            params![kind, expires, to_sql_time(now)],
        )?;
        let acquired = changed == 1;
        debug!(kind, acquired, "queue lock requested");
        Ok(acquired)
    }

    pub fn is_locked(&self, kind: &str) -> Result<bool> {
        Ok(self
            .expiration(kind)?
            .is_some_and(|expires| expires > Utc::now()))
    }

    /// When the `kind` lock expires, if it has ever been taken.
    pub fn expiration(&self, kind: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row(
                "SELECT expires_at FROM queue_locks WHERE lock_type = ?1",
                [kind],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| {
            from_sql_time(&raw).map_err(|e| {
                QueueError::Database(rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                ))
            })
        })
        .transpose()
    }

    /// Drop the `kind` lock early.
    pub fn release(&self, kind: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM queue_locks WHERE lock_type = ?1", [kind])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> QueueLock {
        QueueLock::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn second_set_fails_until_expiry() {
        let lock = lock();
        assert!(!lock.is_locked("cleanup").unwrap());
        assert!(lock.set("cleanup", Duration::from_secs(60)).unwrap());
        assert!(lock.is_locked("cleanup").unwrap());
        assert!(!lock.set("cleanup", Duration::from_secs(60)).unwrap());
        // Different kinds are independent.
        assert!(lock.set("async-request", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn expired_lock_can_be_retaken() {
        let lock = lock();
        assert!(lock.set("cleanup", Duration::ZERO).unwrap());
        assert!(!lock.is_locked("cleanup").unwrap());
        assert!(lock.set("cleanup", Duration::from_secs(60)).unwrap());
        let expires = lock.expiration("cleanup").unwrap().unwrap();
        assert!(expires > Utc::now());
    }

    #[test]
    fn release_frees_the_lock() {
        let lock = lock();
        assert!(lock.set("cleanup", Duration::from_secs(600)).unwrap());
        lock.release("cleanup").unwrap();
        assert_eq!(lock.expiration("cleanup").unwrap(), None);
        assert!(lock.set("cleanup", Duration::from_secs(600)).unwrap());
    }

    #[test]
    fn ttl_past_the_calendar_is_rejected() {
        let lock = lock();
        // Fits a TimeDelta but lands beyond the last representable date.
        let err = lock
            .set("cleanup", Duration::from_secs(10_000_000_000_000))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ACTION");
        assert!(!lock.is_locked("cleanup").unwrap());
        assert_eq!(lock.expiration("cleanup").unwrap(), None);
    }
}
