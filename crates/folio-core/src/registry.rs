//! Authorization registry: durable record of authority-approved ranges.
//!
//! Registering a range materializes one AVAILABLE folio row per number in the
//! same `BEGIN IMMEDIATE` transaction, so a range and its folios become
//! visible together or not at all.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{FolioError, FolioResult};
use crate::model::{
    classify_validity, AuthorizationRange, NewRange, RangeStatus, Validity,
};
use crate::storage::rows::{collect_rows, RangeRow, RANGE_COLUMNS};
use crate::storage::{to_db_number, to_ms, Database};

/// Filter for [`AuthorizationRegistry::list_ranges`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    pub issuer: Option<String>,
    pub doc_type: Option<String>,
    pub status: Option<RangeStatus>,
}

impl RangeFilter {
    pub fn series(issuer: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            issuer: Some(issuer.into()),
            doc_type: Some(doc_type.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: RangeStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Validity and folio counts of one range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeReport {
    pub range: AuthorizationRange,
    pub validity: Validity,
    pub days_to_expiry: i64,
    pub available: u64,
    pub used: u64,
    pub voided: u64,
}

#[derive(Clone)]
pub struct AuthorizationRegistry {
    db: Database,
    clock: Arc<dyn Clock>,
    max_range_size: u64,
}

impl AuthorizationRegistry {
    pub fn new(db: Database, clock: Arc<dyn Clock>, max_range_size: u64) -> Self {
        Self {
            db,
            clock,
            max_range_size,
        }
    }

    fn validate(&self, new: &NewRange) -> FolioResult<()> {
        let invalid = |reason: String| Err(FolioError::InvalidRange { reason });

        if new.issuer.trim().is_empty() || new.doc_type.trim().is_empty() {
            return invalid("issuer and document type are required".into());
        }
        if new.start < 1 {
            return invalid(format!("start must be >= 1, got {}", new.start));
        }
        if new.end < new.start {
            return invalid(format!("end {} is before start {}", new.end, new.start));
        }
        let size = new.end - new.start + 1;
        if size > self.max_range_size {
            return invalid(format!(
                "range of {size} folios exceeds maximum of {}",
                self.max_range_size
            ));
        }
        if new.expires_at <= new.authorized_at {
            return invalid("expiry must be after authorization".into());
        }
        Ok(())
    }

    /// Register a range and materialize its folios.
    ///
    /// Fails with `RangeOverlap` if any number in `[start, end]` is covered by
    /// an ACTIVE or EXPIRED range of the same series, or already has a folio row.
    /// Fails with `InvalidRange` if `start` is not above every number the series
    /// has already issued, since allocation would then go backwards.
    pub fn register_range(&self, new: NewRange) -> FolioResult<AuthorizationRange> {
        self.validate(&new)?;

        let start = to_db_number(new.start)?;
        let end = to_db_number(new.end)?;
        let now = self.clock.now();
        let range_id = uuid::Uuid::new_v4().to_string();

        self.db.immediate(|conn| {
            if let Some(existing) = find_overlap(conn, &new.issuer, &new.doc_type, start, end)? {
                return Err(FolioError::RangeOverlap {
                    issuer: new.issuer.clone(),
                    doc_type: new.doc_type.clone(),
                    start: new.start,
                    end: new.end,
                    existing_range_id: existing,
                });
            }
            if let Some(issued) = max_issued_number(conn, &new.issuer, &new.doc_type)? {
                if start <= issued {
                    return Err(FolioError::InvalidRange {
                        reason: format!(
                            "start {} is not above folio {issued} already issued for {}/{}",
                            new.start, new.issuer, new.doc_type
                        ),
                    });
                }
            }

            conn.execute(
                r#"
                INSERT INTO authorization_ranges (
                    range_id, issuer, doc_type, start_number, end_number,
                    authorized_at_ms, expires_at_ms, status, artifact_hash,
                    source_tracking_id, registered_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ACTIVE', ?8, ?9, ?10)
                "#,
                params![
                    range_id,
                    new.issuer,
                    new.doc_type,
                    start,
                    end,
                    to_ms(new.authorized_at),
                    to_ms(new.expires_at),
                    new.artifact_hash,
                    new.source_tracking_id,
                    to_ms(now),
                ],
            )?;

            let mut insert = conn.prepare_cached(
                "INSERT INTO folios (issuer, doc_type, number, range_id, status)
                 VALUES (?1, ?2, ?3, ?4, 'AVAILABLE')",
            )?;
            for number in start..=end {
                insert.execute(params![new.issuer, new.doc_type, number, range_id])?;
            }
            Ok(())
        })?;

        info!(
            range_id = %range_id,
            issuer = %new.issuer,
            doc_type = %new.doc_type,
            start = new.start,
            end = new.end,
            expires_at = %new.expires_at,
            "authorization range registered"
        );

        Ok(AuthorizationRange {
            range_id,
            issuer: new.issuer,
            doc_type: new.doc_type,
            start: new.start,
            end: new.end,
            authorized_at: new.authorized_at,
            expires_at: new.expires_at,
            status: RangeStatus::Active,
            artifact_hash: new.artifact_hash,
            source_tracking_id: new.source_tracking_id,
            registered_at: now,
            near_expiry_alerted_at: None,
        })
    }

    /// Move every ACTIVE range with `expires_at <= now` to EXPIRED.
    /// Returns the ranges that transitioned.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> FolioResult<Vec<AuthorizationRange>> {
        let now_ms = to_ms(now);
        let expired: Vec<AuthorizationRange> = self.db.immediate(|conn| {
            let mut stmt = conn.prepare(&format!(
                "UPDATE authorization_ranges
                 SET status = 'EXPIRED', status_changed_at_ms = ?1
                 WHERE status = 'ACTIVE' AND expires_at_ms <= ?1
                 RETURNING {RANGE_COLUMNS}"
            ))?;
            let rows = stmt.query_map([now_ms], RangeRow::from_row)?;
            collect_rows(rows)
        })?;

        for range in &expired {
            info!(
                range_id = %range.range_id,
                issuer = %range.issuer,
                doc_type = %range.doc_type,
                expired_at = %range.expires_at,
                "authorization range expired"
            );
        }
        Ok(expired)
    }

    /// Latest-authorized ACTIVE, unexpired range that still holds AVAILABLE folios.
    pub fn get_active_range(&self, issuer: &str, doc_type: &str) -> FolioResult<AuthorizationRange> {
        let now_ms = to_ms(self.clock.now());
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RANGE_COLUMNS} FROM authorization_ranges r
                     WHERE issuer = ?1 AND doc_type = ?2
                       AND status = 'ACTIVE' AND expires_at_ms > ?3
                       AND EXISTS (
                           SELECT 1 FROM folios f
                           WHERE f.range_id = r.range_id AND f.status = 'AVAILABLE'
                       )
                     ORDER BY authorized_at_ms DESC
                     LIMIT 1"
                ),
                params![issuer, doc_type, now_ms],
                RangeRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => row.try_into(),
            None => Err(FolioError::not_found(format!(
                "active range for {issuer}/{doc_type}"
            ))),
        }
    }

    pub fn get_range(&self, range_id: &str) -> FolioResult<AuthorizationRange> {
        let conn = self.db.conn()?;
        load_range(&conn, range_id)?
            .ok_or_else(|| FolioError::not_found(format!("range {range_id}")))
    }

    pub fn list_ranges(&self, filter: &RangeFilter) -> FolioResult<Vec<AuthorizationRange>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RANGE_COLUMNS} FROM authorization_ranges
             WHERE (?1 IS NULL OR issuer = ?1)
               AND (?2 IS NULL OR doc_type = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY issuer, doc_type, start_number"
        ))?;
        let rows = stmt.query_map(
            params![
                filter.issuer,
                filter.doc_type,
                filter.status.map(|s| s.as_str())
            ],
            RangeRow::from_row,
        )?;
        collect_rows(rows)
    }

    /// Validity classification and per-status folio counts for a range.
    pub fn range_status(
        &self,
        range_id: &str,
        now: DateTime<Utc>,
        near_expiry_days: i64,
    ) -> FolioResult<RangeReport> {
        let conn = self.db.conn()?;
        let range = load_range(&conn, range_id)?
            .ok_or_else(|| FolioError::not_found(format!("range {range_id}")))?;

        let (available, used, voided): (i64, i64, i64) = conn.query_row(
            "SELECT
                 COALESCE(SUM(status = 'AVAILABLE'), 0),
                 COALESCE(SUM(status = 'USED'), 0),
                 COALESCE(SUM(status = 'VOID'), 0)
             FROM folios WHERE range_id = ?1",
            [range_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let (validity, days_to_expiry) = match range.status {
            RangeStatus::Expired => (Validity::Expired, (range.expires_at - now).num_days()),
            _ => classify_validity(range.expires_at, now, near_expiry_days),
        };

        Ok(RangeReport {
            range,
            validity,
            days_to_expiry,
            available: available as u64,
            used: used as u64,
            voided: voided as u64,
        })
    }

    /// Record that the near-expiry alert fired for `range_id`.
    /// Returns `false` if it had already been recorded.
    pub fn mark_near_expiry_alerted(&self, range_id: &str, at: DateTime<Utc>) -> FolioResult<bool> {
        let conn = self.db.conn()?;
        let updated = conn.execute(
            "UPDATE authorization_ranges SET near_expiry_alerted_at_ms = ?2
             WHERE range_id = ?1 AND status = 'ACTIVE' AND near_expiry_alerted_at_ms IS NULL",
            params![range_id, to_ms(at)],
        )?;
        debug!(range_id, first = updated > 0, "near-expiry mark");
        Ok(updated > 0)
    }
}

fn load_range(conn: &Connection, range_id: &str) -> FolioResult<Option<AuthorizationRange>> {
    conn.query_row(
        &format!("SELECT {RANGE_COLUMNS} FROM authorization_ranges WHERE range_id = ?1"),
        [range_id],
        RangeRow::from_row,
    )
    .optional()?
    .map(AuthorizationRange::try_from)
    .transpose()
}

/// Id of a range (or of the owner of an existing folio) colliding with `[start, end]`.
fn find_overlap(
    conn: &Connection,
    issuer: &str,
    doc_type: &str,
    start: i64,
    end: i64,
) -> FolioResult<Option<String>> {
    let by_range: Option<String> = conn
        .query_row(
            "SELECT range_id FROM authorization_ranges
             WHERE issuer = ?1 AND doc_type = ?2
               AND status IN ('ACTIVE', 'EXPIRED')
               AND start_number <= ?4 AND end_number >= ?3
             LIMIT 1",
            params![issuer, doc_type, start, end],
            |row| row.get(0),
        )
        .optional()?;
    if by_range.is_some() {
        return Ok(by_range);
    }

    // Numbers of EXHAUSTED ranges are still taken.
    let by_folio: Option<String> = conn
        .query_row(
            "SELECT range_id FROM folios
             WHERE issuer = ?1 AND doc_type = ?2 AND number BETWEEN ?3 AND ?4
             LIMIT 1",
            params![issuer, doc_type, start, end],
            |row| row.get(0),
        )
        .optional()?;
    Ok(by_folio)
}

/// Highest USED or VOID number of a series.
fn max_issued_number(
    conn: &Connection,
    issuer: &str,
    doc_type: &str,
) -> FolioResult<Option<i64>> {
    let max = conn.query_row(
        "SELECT MAX(number) FROM folios
         WHERE issuer = ?1 AND doc_type = ?2 AND status IN ('USED', 'VOID')",
        params![issuer, doc_type],
        |row| row.get(0),
    )?;
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    const ISSUER: &str = "76543210-K";

    fn registry() -> (AuthorizationRegistry, Database, Arc<ManualClock>) {
        let db = Database::memory().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = AuthorizationRegistry::new(db.clone(), clock.clone(), 10_000);
        (registry, db, clock)
    }

    fn range(start: u64, end: u64, now: DateTime<Utc>) -> NewRange {
        NewRange::new(ISSUER, "33", start, end, now, now + Duration::days(180))
    }

    fn folio_count(db: &Database, range_id: &str) -> i64 {
        db.conn()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM folios WHERE range_id = ?1 AND status = 'AVAILABLE'",
                [range_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn test_register_materializes_folios() {
        let (registry, db, clock) = registry();
        let r = registry.register_range(range(1, 5, clock.now())).unwrap();
        assert_eq!(r.status, RangeStatus::Active);
        assert_eq!(r.size(), 5);
        assert_eq!(folio_count(&db, &r.range_id), 5);
    }

    #[test]
    fn test_register_rejects_bad_bounds() {
        let (registry, _, clock) = registry();
        let now = clock.now();
        for bad in [
            range(0, 5, now),
            range(10, 5, now),
            range(1, 10_001, now),
            NewRange::new(ISSUER, "33", 1, 5, now, now),
            NewRange::new("", "33", 1, 5, now, now + Duration::days(1)),
        ] {
            assert!(matches!(
                registry.register_range(bad),
                Err(FolioError::InvalidRange { .. })
            ));
        }
    }

    #[test]
    fn test_register_rejects_overlap_with_active_and_expired() {
        let (registry, _, clock) = registry();
        let now = clock.now();
        let first = registry.register_range(range(1, 100, now)).unwrap();

        let err = registry.register_range(range(100, 200, now)).unwrap_err();
        match err {
            FolioError::RangeOverlap {
                existing_range_id, ..
            } => assert_eq!(existing_range_id, first.range_id),
            other => panic!("expected overlap, got {other:?}"),
        }

        // Expired ranges still reserve their numbers.
        registry.expire_sweep(now + Duration::days(181)).unwrap();
        assert!(matches!(
            registry.register_range(range(50, 60, now)),
            Err(FolioError::RangeOverlap { .. })
        ));

        // Other series are independent.
        registry
            .register_range(NewRange::new(ISSUER, "34", 1, 100, now, now + Duration::days(1)))
            .unwrap();
        registry.register_range(range(101, 200, now)).unwrap();
    }

    #[test]
    fn test_register_below_issued_numbers_rejected() {
        let (registry, db, clock) = registry();
        let now = clock.now();
        registry.register_range(range(11, 20, now)).unwrap();
        let allocator = crate::allocator::FolioAllocator::new(db, clock.clone());
        assert_eq!(allocator.assign_next(ISSUER, "33").unwrap().folio.number, 11);

        assert!(matches!(
            registry.register_range(range(1, 10, now)),
            Err(FolioError::InvalidRange { .. })
        ));
        assert_eq!(allocator.assign_next(ISSUER, "33").unwrap().folio.number, 12);

        // Above the issued mark is fine, as is another series.
        registry.register_range(range(21, 30, now)).unwrap();
        registry
            .register_range(NewRange::new(ISSUER, "34", 1, 10, now, now + Duration::days(1)))
            .unwrap();
    }

    #[test]
    fn test_expire_sweep_returns_only_transitioned() {
        let (registry, _, clock) = registry();
        let now = clock.now();
        let short = registry
            .register_range(NewRange::new(ISSUER, "33", 1, 5, now, now + Duration::days(1)))
            .unwrap();
        registry.register_range(range(6, 10, now)).unwrap();

        let expired = registry.expire_sweep(now + Duration::days(2)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].range_id, short.range_id);
        assert_eq!(expired[0].status, RangeStatus::Expired);

        assert!(registry.expire_sweep(now + Duration::days(2)).unwrap().is_empty());
    }

    #[test]
    fn test_get_active_range_prefers_latest_authorized() {
        let (registry, _, clock) = registry();
        let now = clock.now();
        registry.register_range(range(1, 5, now - Duration::days(10))).unwrap();
        let newer = registry.register_range(range(6, 10, now)).unwrap();

        assert_eq!(
            registry.get_active_range(ISSUER, "33").unwrap().range_id,
            newer.range_id
        );
        assert!(matches!(
            registry.get_active_range(ISSUER, "52"),
            Err(FolioError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_ranges_filters() {
        let (registry, _, clock) = registry();
        let now = clock.now();
        registry.register_range(range(1, 5, now)).unwrap();
        registry
            .register_range(NewRange::new(ISSUER, "61", 1, 5, now, now + Duration::days(1)))
            .unwrap();

        assert_eq!(registry.list_ranges(&RangeFilter::default()).unwrap().len(), 2);
        assert_eq!(
            registry
                .list_ranges(&RangeFilter::series(ISSUER, "61"))
                .unwrap()
                .len(),
            1
        );
        assert!(registry
            .list_ranges(&RangeFilter::default().with_status(RangeStatus::Expired))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_range_status_counts_and_validity() {
        let (registry, _, clock) = registry();
        let now = clock.now();
        let r = registry
            .register_range(NewRange::new(ISSUER, "33", 1, 5, now, now + Duration::days(10)))
            .unwrap();

        let report = registry.range_status(&r.range_id, now, 15).unwrap();
        assert_eq!(report.validity, Validity::NearExpiry);
        assert_eq!(report.available, 5);
        assert_eq!(report.used, 0);

        assert!(matches!(
            registry.range_status("missing", now, 15),
            Err(FolioError::NotFound { .. })
        ));
    }

    #[test]
    fn test_near_expiry_mark_fires_once() {
        let (registry, _, clock) = registry();
        let r = registry.register_range(range(1, 5, clock.now())).unwrap();
        assert!(registry.mark_near_expiry_alerted(&r.range_id, clock.now()).unwrap());
        assert!(!registry.mark_near_expiry_alerted(&r.range_id, clock.now()).unwrap());
        assert!(registry
            .get_range(&r.range_id)
            .unwrap()
            .near_expiry_alerted_at
            .is_some());
    }
}
