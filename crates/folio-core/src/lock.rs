//! TTL-bounded named locks.
//!
//! Locks de-duplicate replenishment triggers across processes. They are
//! advisory: a lease can expire while its holder still runs, so nothing that
//! must be exactly-once relies on a lease alone. Every acquisition bumps a
//! per-key fencing token so a stale holder can be told apart from the current one.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{FolioError, FolioResult};
use crate::storage::{from_ms, to_ms, Database};

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    /// Opaque holder identity; only the holder can renew or release.
    pub token: String,
    /// Strictly increases each time the key changes hands.
    pub fencing_token: u64,
    pub deadline: DateTime<Utc>,
}

pub trait LockService: Send + Sync {
    /// Take `key` for `ttl`, or fail fast with `LockBusy`.
    fn acquire(&self, key: &str, ttl: Duration) -> FolioResult<LockLease>;

    /// Extend a held lease. Fails with `LockLost` once it expired or changed hands.
    fn renew(&self, lease: &LockLease, ttl: Duration) -> FolioResult<LockLease>;

    /// Release a lease. No-op if it already expired or was released.
    fn release(&self, lease: &LockLease) -> FolioResult<()>;
}

/// Deadline for a lease taken at `acquired_at_ms`.
#[inline]
pub fn compute_lock_deadline(acquired_at_ms: i64, ttl_ms: i64) -> i64 {
    acquired_at_ms.saturating_add(ttl_ms)
}

/// A lock is free once released (`deadline_ms == 0`) or past its deadline.
#[inline]
pub fn is_lock_expired(deadline_ms: i64, now_ms: i64) -> bool {
    deadline_ms == 0 || now_ms > deadline_ms
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Lock service on the shared SQLite database.
#[derive(Clone)]
pub struct SqliteLockService {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteLockService {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Current holder of `key`, if the lease is still live.
    pub fn holder(&self, key: &str) -> FolioResult<Option<LockLease>> {
        let now_ms = to_ms(self.clock.now());
        let conn = self.db.conn()?;
        let row: Option<(String, i64, i64)> = conn
            .query_row(
                "SELECT holder_token, fencing_token, deadline_ms FROM locks WHERE lock_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((token, fencing, deadline_ms)) if !is_lock_expired(deadline_ms, now_ms) => {
                Ok(Some(LockLease {
                    key: key.to_string(),
                    token,
                    fencing_token: fencing as u64,
                    deadline: from_ms(deadline_ms)?,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl LockService for SqliteLockService {
    fn acquire(&self, key: &str, ttl: Duration) -> FolioResult<LockLease> {
        let now_ms = to_ms(self.clock.now());
        let deadline_ms = compute_lock_deadline(now_ms, ttl_ms(ttl));
        let token = uuid::Uuid::new_v4().to_string();

        let conn = self.db.conn()?;
        // Single statement: insert, or take over only if the current lease is expired.
        let fencing: Option<i64> = conn
            .query_row(
                r#"
                INSERT INTO locks (lock_key, holder_token, fencing_token, acquired_at_ms, deadline_ms)
                VALUES (?1, ?2, 1, ?3, ?4)
                ON CONFLICT(lock_key) DO UPDATE SET
                    holder_token = excluded.holder_token,
                    fencing_token = locks.fencing_token + 1,
                    acquired_at_ms = excluded.acquired_at_ms,
                    deadline_ms = excluded.deadline_ms
                WHERE locks.deadline_ms = 0 OR locks.deadline_ms < excluded.acquired_at_ms
                RETURNING fencing_token
                "#,
                params![key, token, now_ms, deadline_ms],
                |row| row.get(0),
            )
            .optional()?;

        match fencing {
            Some(fencing) => {
                debug!(key, fencing_token = fencing, ttl_ms = ttl_ms(ttl), "lock acquired");
                Ok(LockLease {
                    key: key.to_string(),
                    token,
                    fencing_token: fencing as u64,
                    deadline: from_ms(deadline_ms)?,
                })
            }
            None => Err(FolioError::LockBusy {
                key: key.to_string(),
            }),
        }
    }

    fn renew(&self, lease: &LockLease, ttl: Duration) -> FolioResult<LockLease> {
        let now_ms = to_ms(self.clock.now());
        let deadline_ms = compute_lock_deadline(now_ms, ttl_ms(ttl));

        let conn = self.db.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE locks SET deadline_ms = ?3
            WHERE lock_key = ?1 AND holder_token = ?2 AND deadline_ms >= ?4
            "#,
            params![lease.key, lease.token, deadline_ms, now_ms],
        )?;

        if updated == 0 {
            return Err(FolioError::LockLost {
                key: lease.key.clone(),
            });
        }

        Ok(LockLease {
            deadline: from_ms(deadline_ms)?,
            ..lease.clone()
        })
    }

    fn release(&self, lease: &LockLease) -> FolioResult<()> {
        let conn = self.db.conn()?;
        let released = conn.execute(
            "UPDATE locks SET deadline_ms = 0 WHERE lock_key = ?1 AND holder_token = ?2",
            params![lease.key, lease.token],
        )?;
        debug!(key = %lease.key, released = released > 0, "lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service() -> (SqliteLockService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let svc = SqliteLockService::new(Database::memory().unwrap(), clock.clone());
        (svc, clock)
    }

    #[test]
    fn test_lock_expiry_math() {
        assert!(is_lock_expired(0, 1000));
        assert!(is_lock_expired(1000, 2000));
        assert!(!is_lock_expired(2000, 1000));
        assert!(!is_lock_expired(2000, 2000));
        assert_eq!(compute_lock_deadline(i64::MAX - 1, 10), i64::MAX);
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let (svc, _) = service();
        let lease = svc.acquire("replenish:i:33", Duration::from_secs(30)).unwrap();
        assert_eq!(lease.fencing_token, 1);

        let second = svc.acquire("replenish:i:33", Duration::from_secs(30));
        assert!(matches!(second, Err(FolioError::LockBusy { .. })));

        // Different key is independent.
        assert!(svc.acquire("replenish:i:34", Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_expired_lock_can_be_taken_over_with_higher_fencing_token() {
        let (svc, clock) = service();
        let first = svc.acquire("k", Duration::from_secs(30)).unwrap();

        clock.advance(chrono::Duration::seconds(31));
        let second = svc.acquire("k", Duration::from_secs(30)).unwrap();
        assert!(second.fencing_token > first.fencing_token);
        assert_ne!(second.token, first.token);

        // The stale holder can neither renew nor release the new lease.
        assert!(matches!(
            svc.renew(&first, Duration::from_secs(30)),
            Err(FolioError::LockLost { .. })
        ));
        svc.release(&first).unwrap();
        assert_eq!(svc.holder("k").unwrap().unwrap().token, second.token);
    }

    #[test]
    fn test_release_is_idempotent_and_frees_key() {
        let (svc, _) = service();
        let lease = svc.acquire("k", Duration::from_secs(30)).unwrap();
        svc.release(&lease).unwrap();
        svc.release(&lease).unwrap();
        assert!(svc.holder("k").unwrap().is_none());
        assert!(svc.acquire("k", Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_renew_extends_deadline() {
        let (svc, clock) = service();
        let lease = svc.acquire("k", Duration::from_secs(30)).unwrap();

        clock.advance(chrono::Duration::seconds(20));
        let renewed = svc.renew(&lease, Duration::from_secs(30)).unwrap();
        assert!(renewed.deadline > lease.deadline);

        clock.advance(chrono::Duration::seconds(20));
        assert!(matches!(
            svc.acquire("k", Duration::from_secs(30)),
            Err(FolioError::LockBusy { .. })
        ));
    }

    #[test]
    fn test_renew_after_expiry_is_lost() {
        let (svc, clock) = service();
        let lease = svc.acquire("k", Duration::from_secs(30)).unwrap();
        clock.advance(chrono::Duration::seconds(31));
        assert!(matches!(
            svc.renew(&lease, Duration::from_secs(30)),
            Err(FolioError::LockLost { .. })
        ));
    }
}
