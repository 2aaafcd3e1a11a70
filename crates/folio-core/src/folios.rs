//! Folio store: per-number records, counts, voiding, document binding and
//! usage reporting. Allocation itself lives in [`crate::allocator`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{AlertEvent, AlertSink};
use crate::clock::Clock;
use crate::error::{FolioError, FolioResult};
use crate::model::{Folio, FolioStatus};
use crate::storage::rows::{collect_rows, FolioRow, FOLIO_COLUMNS};
use crate::storage::{from_ms, to_db_number, to_ms, Database};

/// Folio activity of a series over a period.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub issuer: String,
    pub doc_type: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub used: u64,
    pub voided: u64,
    /// Folios used or voided in the period, by number.
    pub folios: Vec<Folio>,
    /// Every ACTIVE range of the series.
    pub active_ranges: Vec<RangeUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeUsage {
    pub range_id: String,
    pub start: u64,
    pub end: u64,
    pub expires_at: DateTime<Utc>,
    pub available: u64,
    pub used: u64,
    pub voided: u64,
}

#[derive(Clone)]
pub struct FolioStore {
    db: Database,
    clock: Arc<dyn Clock>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl FolioStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            alerts: None,
        }
    }

    /// Raise `FOLIOS_EXHAUSTED` when a void takes the series' last AVAILABLE folio.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// AVAILABLE folios in ACTIVE ranges not yet expired at `now`.
    pub fn count_available(
        &self,
        issuer: &str,
        doc_type: &str,
        now: DateTime<Utc>,
    ) -> FolioResult<u64> {
        let conn = self.db.conn()?;
        count_available_at(&conn, issuer, doc_type, to_ms(now))
    }

    /// AVAILABLE folios in ACTIVE ranges that are still valid after `cutoff`.
    pub fn count_available_beyond(
        &self,
        issuer: &str,
        doc_type: &str,
        cutoff: DateTime<Utc>,
    ) -> FolioResult<u64> {
        self.count_available(issuer, doc_type, cutoff)
    }

    /// Highest folio number ever materialized for the series.
    pub fn max_number(&self, issuer: &str, doc_type: &str) -> FolioResult<Option<u64>> {
        let conn = self.db.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(number) FROM folios WHERE issuer = ?1 AND doc_type = ?2",
            params![issuer, doc_type],
            |row| row.get(0),
        )?;
        Ok(max.map(|n| n as u64))
    }

    pub fn get_folio(&self, issuer: &str, doc_type: &str, number: u64) -> FolioResult<Folio> {
        let conn = self.db.conn()?;
        load_folio(&conn, issuer, doc_type, to_db_number(number)?)?
            .ok_or_else(|| FolioError::not_found(format!("folio {issuer}/{doc_type}/{number}")))
    }

    /// Void an AVAILABLE folio. Its range becomes EXHAUSTED if this was the
    /// last AVAILABLE number in it.
    pub fn void_folio(
        &self,
        issuer: &str,
        doc_type: &str,
        number: u64,
        reason: &str,
    ) -> FolioResult<Folio> {
        if reason.trim().is_empty() {
            return Err(FolioError::InvalidRequest {
                reason: "void reason is required".into(),
            });
        }
        let n = to_db_number(number)?;
        let now_ms = to_ms(self.clock.now());

        let (folio, remaining) = self.db.immediate(|conn| {
            let current = load_folio(conn, issuer, doc_type, n)?.ok_or_else(|| {
                FolioError::not_found(format!("folio {issuer}/{doc_type}/{number}"))
            })?;
            if current.status != FolioStatus::Available {
                return Err(FolioError::InvalidTransition {
                    subject: format!("folio {issuer}/{doc_type}/{number}"),
                    from: current.status.as_str().into(),
                    to: FolioStatus::Void.as_str().into(),
                });
            }

            conn.execute(
                "UPDATE folios SET status = 'VOID', voided_at_ms = ?4, void_reason = ?5
                 WHERE issuer = ?1 AND doc_type = ?2 AND number = ?3 AND status = 'AVAILABLE'",
                params![issuer, doc_type, n, now_ms, reason],
            )?;
            mark_exhausted_if_empty(conn, &current.range_id, now_ms)?;

            let folio = load_folio(conn, issuer, doc_type, n)?
                .ok_or_else(|| FolioError::Database("voided folio vanished".into()))?;
            Ok((folio, count_available_at(conn, issuer, doc_type, now_ms)?))
        })?;

        warn!(issuer, doc_type, number, reason, remaining, "folio voided");
        if remaining == 0 {
            if let Some(alerts) = &self.alerts {
                alerts.emit(AlertEvent::FoliosExhausted {
                    issuer: issuer.to_string(),
                    doc_type: doc_type.to_string(),
                });
            }
        }
        Ok(folio)
    }

    /// Attach the consuming document to a USED folio. Binding the same
    /// document twice is a no-op; rebinding to another document is rejected.
    pub fn bind_document(
        &self,
        issuer: &str,
        doc_type: &str,
        number: u64,
        document_id: &str,
    ) -> FolioResult<Folio> {
        let n = to_db_number(number)?;
        let subject = || format!("folio {issuer}/{doc_type}/{number}");

        self.db.immediate(|conn| {
            let current = load_folio(conn, issuer, doc_type, n)?
                .ok_or_else(|| FolioError::not_found(subject()))?;

            let bound = current.document_id.clone();
            match (current.status, bound.as_deref()) {
                (FolioStatus::Used, Some(existing)) if existing == document_id => Ok(current),
                (FolioStatus::Used, None) => {
                    conn.execute(
                        "UPDATE folios SET document_id = ?4
                         WHERE issuer = ?1 AND doc_type = ?2 AND number = ?3
                           AND status = 'USED' AND document_id IS NULL",
                        params![issuer, doc_type, n, document_id],
                    )?;
                    Ok(Folio {
                        document_id: Some(document_id.to_string()),
                        ..current
                    })
                }
                (FolioStatus::Used, Some(existing)) => Err(FolioError::InvalidTransition {
                    subject: subject(),
                    from: format!("bound to {existing}"),
                    to: format!("bound to {document_id}"),
                }),
                (status, _) => Err(FolioError::InvalidTransition {
                    subject: subject(),
                    from: status.as_str().into(),
                    to: "bound".into(),
                }),
            }
        })
    }

    /// Folios used or voided in `[from, to]` plus the state of every ACTIVE range.
    pub fn usage_report(
        &self,
        issuer: &str,
        doc_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> FolioResult<UsageReport> {
        if to < from {
            return Err(FolioError::InvalidRequest {
                reason: "report period ends before it starts".into(),
            });
        }
        let (from_bound, to_bound) = (to_ms(from), to_ms(to));
        let conn = self.db.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {FOLIO_COLUMNS} FROM folios
             WHERE issuer = ?1 AND doc_type = ?2
               AND ((used_at_ms BETWEEN ?3 AND ?4) OR (voided_at_ms BETWEEN ?3 AND ?4))
             ORDER BY number"
        ))?;
        let rows = stmt.query_map(
            params![issuer, doc_type, from_bound, to_bound],
            FolioRow::from_row,
        )?;
        let folios: Vec<Folio> = collect_rows(rows)?;

        let used = folios.iter().filter(|f| f.status == FolioStatus::Used).count() as u64;
        let voided = folios.iter().filter(|f| f.status == FolioStatus::Void).count() as u64;

        let mut stmt = conn.prepare(
            "SELECT r.range_id, r.start_number, r.end_number, r.expires_at_ms,
                    COALESCE(SUM(f.status = 'AVAILABLE'), 0),
                    COALESCE(SUM(f.status = 'USED'), 0),
                    COALESCE(SUM(f.status = 'VOID'), 0)
             FROM authorization_ranges r
             LEFT JOIN folios f ON f.range_id = r.range_id
             WHERE r.issuer = ?1 AND r.doc_type = ?2 AND r.status = 'ACTIVE'
             GROUP BY r.range_id
             ORDER BY r.start_number",
        )?;
        let raw: Vec<(String, i64, i64, i64, i64, i64, i64)> = stmt
            .query_map(params![issuer, doc_type], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut active_ranges = Vec::with_capacity(raw.len());
        for (range_id, start, end, expires_at_ms, available, used, voided) in raw {
            active_ranges.push(RangeUsage {
                range_id,
                start: start as u64,
                end: end as u64,
                expires_at: from_ms(expires_at_ms)?,
                available: available as u64,
                used: used as u64,
                voided: voided as u64,
            });
        }

        info!(issuer, doc_type, used, voided, "usage report generated");

        Ok(UsageReport {
            issuer: issuer.to_string(),
            doc_type: doc_type.to_string(),
            from,
            to,
            used,
            voided,
            folios,
            active_ranges,
        })
    }
}

pub(crate) fn load_folio(
    conn: &Connection,
    issuer: &str,
    doc_type: &str,
    number: i64,
) -> FolioResult<Option<Folio>> {
    conn.query_row(
        &format!(
            "SELECT {FOLIO_COLUMNS} FROM folios WHERE issuer = ?1 AND doc_type = ?2 AND number = ?3"
        ),
        params![issuer, doc_type, number],
        FolioRow::from_row,
    )
    .optional()?
    .map(Folio::try_from)
    .transpose()
}

/// AVAILABLE folios of the series in ACTIVE ranges with `expires_at > after_ms`.
pub(crate) fn count_available_at(
    conn: &Connection,
    issuer: &str,
    doc_type: &str,
    after_ms: i64,
) -> FolioResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM folios f
         JOIN authorization_ranges r ON r.range_id = f.range_id
         WHERE f.issuer = ?1 AND f.doc_type = ?2 AND f.status = 'AVAILABLE'
           AND r.status = 'ACTIVE' AND r.expires_at_ms > ?3",
        params![issuer, doc_type, after_ms],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// ACTIVE -> EXHAUSTED once no AVAILABLE folio remains. Returns whether it transitioned.
pub(crate) fn mark_exhausted_if_empty(
    conn: &Connection,
    range_id: &str,
    now_ms: i64,
) -> FolioResult<bool> {
    let updated = conn.execute(
        "UPDATE authorization_ranges SET status = 'EXHAUSTED', status_changed_at_ms = ?2
         WHERE range_id = ?1 AND status = 'ACTIVE'
           AND NOT EXISTS (
               SELECT 1 FROM folios WHERE range_id = ?1 AND status = 'AVAILABLE'
           )",
        params![range_id, now_ms],
    )?;
    if updated > 0 {
        info!(range_id, "authorization range exhausted");
    }
    Ok(updated > 0)
}
