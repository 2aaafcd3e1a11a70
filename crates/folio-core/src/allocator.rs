//! Folio allocator: hands out the next number of a series.
//!
//! Allocation is one conditional `UPDATE ... RETURNING` inside a
//! `BEGIN IMMEDIATE` transaction. Writers on every connection serialize on
//! the database write lock, and the update only matches a row that is still
//! AVAILABLE, so no number can be handed out twice.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use crate::alerts::{AlertEvent, AlertSink};
use crate::clock::Clock;
use crate::error::{FolioError, FolioResult};
use crate::folios::{count_available_at, mark_exhausted_if_empty};
use crate::model::Folio;
use crate::replenish::{ReplenishTrigger, TriggerSender};
use crate::storage::rows::{FolioRow, FOLIO_COLUMNS};
use crate::storage::{from_ms, to_ms, Database};

/// Result of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub folio: Folio,
    /// AVAILABLE folios left in the series after this one.
    pub remaining: u64,
    /// Whether this allocation emptied the folio's range.
    pub range_exhausted: bool,
}

#[derive(Clone)]
pub struct FolioAllocator {
    db: Database,
    clock: Arc<dyn Clock>,
    threshold: u64,
    trigger: Option<TriggerSender>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl FolioAllocator {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            threshold: 0,
            trigger: None,
            alerts: None,
        }
    }

    /// Enqueue replenishment whenever the remaining count is at or below `threshold`.
    pub fn with_replenishment(mut self, threshold: u64, trigger: TriggerSender) -> Self {
        self.threshold = threshold;
        self.trigger = Some(trigger);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Assign the smallest AVAILABLE folio of an ACTIVE, unexpired range.
    pub fn assign_next(&self, issuer: &str, doc_type: &str) -> FolioResult<Assignment> {
        self.assign(issuer, doc_type, None)
    }

    /// Like [`assign_next`](Self::assign_next), binding the folio to `document_id`
    /// in the same step.
    pub fn assign_next_for_document(
        &self,
        issuer: &str,
        doc_type: &str,
        document_id: &str,
    ) -> FolioResult<Assignment> {
        self.assign(issuer, doc_type, Some(document_id))
    }

    fn assign(
        &self,
        issuer: &str,
        doc_type: &str,
        document_id: Option<&str>,
    ) -> FolioResult<Assignment> {
        let now_ms = to_ms(self.clock.now());

        // Low-water check happens whether or not this allocation succeeds.
        if let Some(trigger) = &self.trigger {
            let remaining = {
                let conn = self.db.conn()?;
                count_available_at(&conn, issuer, doc_type, now_ms)?
            };
            if remaining <= self.threshold {
                debug!(
                    issuer,
                    doc_type,
                    remaining,
                    threshold = self.threshold,
                    "below low-water mark"
                );
                trigger.send(ReplenishTrigger::new(issuer, doc_type, self.threshold));
            }
        }

        let assignment = self.db.immediate(|conn| {
            let Some(folio) = take_next(conn, issuer, doc_type, now_ms, document_id)? else {
                return Err(classify_failure(conn, issuer, doc_type, now_ms)?);
            };
            let range_exhausted = mark_exhausted_if_empty(conn, &folio.range_id, now_ms)?;
            let remaining = count_available_at(conn, issuer, doc_type, now_ms)?;
            Ok(Assignment {
                folio,
                remaining,
                range_exhausted,
            })
        })?;

        info!(
            issuer,
            doc_type,
            number = assignment.folio.number,
            range_id = %assignment.folio.range_id,
            remaining = assignment.remaining,
            "folio assigned"
        );

        if assignment.remaining == 0 {
            if let Some(alerts) = &self.alerts {
                alerts.emit(AlertEvent::FoliosExhausted {
                    issuer: issuer.to_string(),
                    doc_type: doc_type.to_string(),
                });
            }
        }

        Ok(assignment)
    }
}

fn take_next(
    conn: &Connection,
    issuer: &str,
    doc_type: &str,
    now_ms: i64,
    document_id: Option<&str>,
) -> FolioResult<Option<Folio>> {
    let row = conn
        .query_row(
            &format!(
                "UPDATE folios
                 SET status = 'USED', used_at_ms = ?3, document_id = ?4
                 WHERE rowid = (
                     SELECT f.rowid FROM folios f
                     JOIN authorization_ranges r ON r.range_id = f.range_id
                     WHERE f.issuer = ?1 AND f.doc_type = ?2 AND f.status = 'AVAILABLE'
                       AND r.status = 'ACTIVE' AND r.expires_at_ms > ?3
                     ORDER BY f.number
                     LIMIT 1
                 )
                 AND status = 'AVAILABLE'
                 RETURNING {FOLIO_COLUMNS}"
            ),
            params![issuer, doc_type, now_ms, document_id],
            FolioRow::from_row,
        )
        .optional()?;
    row.map(Folio::try_from).transpose()
}

/// Why nothing could be assigned: an expired range still holding numbers
/// reports `CafExpired`, anything else `NoFolioAvailable`.
fn classify_failure(
    conn: &Connection,
    issuer: &str,
    doc_type: &str,
    now_ms: i64,
) -> FolioResult<FolioError> {
    let expired: Option<(String, i64)> = conn
        .query_row(
            "SELECT r.range_id, r.expires_at_ms FROM authorization_ranges r
             WHERE r.issuer = ?1 AND r.doc_type = ?2
               AND (r.status = 'EXPIRED' OR (r.status = 'ACTIVE' AND r.expires_at_ms <= ?3))
               AND EXISTS (
                   SELECT 1 FROM folios f
                   WHERE f.range_id = r.range_id AND f.status = 'AVAILABLE'
               )
             ORDER BY r.expires_at_ms DESC
             LIMIT 1",
            params![issuer, doc_type, now_ms],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(match expired {
        Some((range_id, expires_at_ms)) => FolioError::CafExpired {
            issuer: issuer.to_string(),
            doc_type: doc_type.to_string(),
            range_id,
            expired_at: from_ms(expires_at_ms)?,
        },
        None => FolioError::NoFolioAvailable {
            issuer: issuer.to_string(),
            doc_type: doc_type.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertSink;
    use crate::clock::ManualClock;
    use crate::model::{FolioStatus, NewRange, RangeStatus};
    use crate::registry::AuthorizationRegistry;
    use crate::replenish::trigger_channel;
    use chrono::{DateTime, Duration, Utc};

    const ISSUER: &str = "76543210-K";

    fn setup() -> (FolioAllocator, AuthorizationRegistry, Arc<ManualClock>) {
        let db = Database::memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = AuthorizationRegistry::new(db.clone(), clock.clone(), 10_000);
        (FolioAllocator::new(db, clock.clone()), registry, clock)
    }

    fn register(
        registry: &AuthorizationRegistry,
        start: u64,
        end: u64,
        days: i64,
        now: DateTime<Utc>,
    ) -> String {
        let expires = now + Duration::days(days);
        registry
            .register_range(NewRange::new(ISSUER, "33", start, end, now, expires))
            .unwrap()
            .range_id
    }

    #[test]
    fn test_sequential_assignment_then_exhaustion() {
        let (allocator, registry, clock) = setup();
        let range_id = register(&registry, 1, 5, 180, clock.now());

        let numbers: Vec<u64> = (0..5)
            .map(|_| allocator.assign_next(ISSUER, "33").unwrap().folio.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

        assert!(matches!(
            allocator.assign_next(ISSUER, "33"),
            Err(FolioError::NoFolioAvailable { .. })
        ));
        assert_eq!(registry.get_range(&range_id).unwrap().status, RangeStatus::Exhausted);
    }

    #[test]
    fn test_assignment_stamps_folio() {
        let (allocator, registry, clock) = setup();
        register(&registry, 1, 5, 180, clock.now());

        let a = allocator
            .assign_next_for_document(ISSUER, "33", "invoice-9")
            .unwrap();
        assert_eq!(a.folio.status, FolioStatus::Used);
        assert_eq!(
            a.folio.used_at.map(|t| t.timestamp_millis()),
            Some(clock.now().timestamp_millis())
        );
        assert_eq!(a.folio.document_id.as_deref(), Some("invoice-9"));
        assert_eq!(a.remaining, 4);
        assert!(!a.range_exhausted);
    }

    #[test]
    fn test_unswept_expired_range_is_never_used() {
        let (allocator, registry, clock) = setup();
        register(&registry, 1, 5, 1, clock.now());

        clock.advance(Duration::days(2));
        match allocator.assign_next(ISSUER, "33") {
            Err(FolioError::CafExpired { range_id, .. }) => assert!(!range_id.is_empty()),
            other => panic!("expected CafExpired, got {other:?}"),
        }

        // After the sweep it is still reported as expired.
        registry.expire_sweep(clock.now()).unwrap();
        assert!(matches!(
            allocator.assign_next(ISSUER, "33"),
            Err(FolioError::CafExpired { .. })
        ));
    }

    #[test]
    fn test_fresh_range_wins_over_expired_one() {
        let (allocator, registry, clock) = setup();
        register(&registry, 1, 5, 1, clock.now());
        clock.advance(Duration::days(2));
        register(&registry, 6, 10, 180, clock.now());

        assert_eq!(allocator.assign_next(ISSUER, "33").unwrap().folio.number, 6);
    }

    #[test]
    fn test_unknown_series_is_no_folio_available() {
        let (allocator, _, _) = setup();
        assert!(matches!(
            allocator.assign_next(ISSUER, "52"),
            Err(FolioError::NoFolioAvailable { .. })
        ));
    }

    #[test]
    fn test_low_water_triggers_and_exhaustion_alerts() {
        let (allocator, registry, clock) = setup();
        register(&registry, 1, 3, 180, clock.now());

        let (tx, mut rx) = trigger_channel();
        let sink = Arc::new(MemoryAlertSink::new());
        let allocator = allocator
            .with_replenishment(2, tx)
            .with_alerts(sink.clone());

        // 3 remaining: above threshold.
        allocator.assign_next(ISSUER, "33").unwrap();
        assert!(rx.try_recv().is_err());

        // 2 remaining: at threshold.
        allocator.assign_next(ISSUER, "33").unwrap();
        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.issuer, ISSUER);
        assert_eq!(trigger.threshold, 2);

        allocator.assign_next(ISSUER, "33").unwrap();
        assert_eq!(sink.count("FOLIOS_EXHAUSTED"), 1);

        // Failing allocations still trigger.
        let _ = rx.try_recv();
        assert!(allocator.assign_next(ISSUER, "33").is_err());
        assert!(rx.try_recv().is_ok());
    }
}
