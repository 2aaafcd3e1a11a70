//! Durable record of replenishment requests sent to the authority.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::{FolioError, FolioResult};
use crate::model::{ReplenishmentRequest, RequestStatus};
use crate::storage::rows::{collect_rows, RequestRow, REQUEST_COLUMNS};
use crate::storage::{is_unique_violation, to_db_number, to_ms, Database};

#[derive(Debug, Clone)]
pub struct RequestStore {
    db: Database,
}

impl RequestStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new PENDING request.
    pub fn insert_pending(&self, request: &ReplenishmentRequest) -> FolioResult<()> {
        if request.status != RequestStatus::Pending {
            return Err(FolioError::InvalidRequest {
                reason: format!("new request must be PENDING, got {}", request.status.as_str()),
            });
        }
        let conn = self.db.conn()?;
        let result = conn.execute(
            "INSERT INTO replenishment_requests (
                 tracking_id, issuer, doc_type, start_number, end_number, status, requested_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6)",
            params![
                request.tracking_id,
                request.issuer,
                request.doc_type,
                to_db_number(request.start)?,
                to_db_number(request.end)?,
                to_ms(request.requested_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(FolioError::InvalidRequest {
                reason: format!(
                    "a pending request already exists for {}/{} or tracking id {} is taken",
                    request.issuer, request.doc_type, request.tracking_id
                ),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, tracking_id: &str) -> FolioResult<ReplenishmentRequest> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM replenishment_requests WHERE tracking_id = ?1"),
            [tracking_id],
            RequestRow::from_row,
        )
        .optional()?
        .ok_or_else(|| FolioError::not_found(format!("replenishment request {tracking_id}")))?
        .try_into()
    }

    /// The PENDING request of a series, if any.
    pub fn pending_for(
        &self,
        issuer: &str,
        doc_type: &str,
    ) -> FolioResult<Option<ReplenishmentRequest>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "SELECT {REQUEST_COLUMNS} FROM replenishment_requests
                 WHERE issuer = ?1 AND doc_type = ?2 AND status = 'PENDING'"
            ),
            params![issuer, doc_type],
            RequestRow::from_row,
        )
        .optional()?
        .map(ReplenishmentRequest::try_from)
        .transpose()
    }

    pub fn list_pending(&self) -> FolioResult<Vec<ReplenishmentRequest>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM replenishment_requests
             WHERE status = 'PENDING' ORDER BY requested_at_ms"
        ))?;
        let rows = stmt.query_map([], RequestRow::from_row)?;
        collect_rows(rows)
    }

    /// Requests of a series, newest first.
    pub fn list_for(
        &self,
        issuer: &str,
        doc_type: &str,
    ) -> FolioResult<Vec<ReplenishmentRequest>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM replenishment_requests
             WHERE issuer = ?1 AND doc_type = ?2 ORDER BY requested_at_ms DESC"
        ))?;
        let rows = stmt.query_map(params![issuer, doc_type], RequestRow::from_row)?;
        collect_rows(rows)
    }

    pub fn mark_accepted(
        &self,
        tracking_id: &str,
        range_id: &str,
        at: DateTime<Utc>,
    ) -> FolioResult<()> {
        self.resolve(tracking_id, RequestStatus::Accepted, None, Some(range_id), at)
    }

    pub fn mark_rejected(
        &self,
        tracking_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> FolioResult<()> {
        self.resolve(tracking_id, RequestStatus::Rejected, Some(reason), None, at)
    }

    pub fn mark_timed_out(&self, tracking_id: &str, at: DateTime<Utc>) -> FolioResult<()> {
        self.resolve(tracking_id, RequestStatus::TimedOut, None, None, at)
    }

    /// PENDING -> terminal. Fails with `InvalidTransition` if the request was
    /// already resolved.
    fn resolve(
        &self,
        tracking_id: &str,
        status: RequestStatus,
        reason: Option<&str>,
        range_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> FolioResult<()> {
        let updated = {
            let conn = self.db.conn()?;
            conn.execute(
                "UPDATE replenishment_requests
                 SET status = ?2, reason = ?3, range_id = ?4, resolved_at_ms = ?5
                 WHERE tracking_id = ?1 AND status = 'PENDING'",
                params![tracking_id, status.as_str(), reason, range_id, to_ms(at)],
            )?
        };

        if updated == 0 {
            let current = self.get(tracking_id)?;
            return Err(FolioError::InvalidTransition {
                subject: format!("request {tracking_id}"),
                from: current.status.as_str().into(),
                to: status.as_str().into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(tracking_id: &str, doc_type: &str) -> ReplenishmentRequest {
        ReplenishmentRequest {
            tracking_id: tracking_id.into(),
            issuer: "76543210-K".into(),
            doc_type: doc_type.into(),
            start: 101,
            end: 1100,
            status: RequestStatus::Pending,
            reason: None,
            range_id: None,
            requested_at: DateTime::from_timestamp_millis(1_760_000_000_000).unwrap(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let store = RequestStore::new(Database::memory().unwrap());
        let req = pending("trk-1", "33");
        store.insert_pending(&req).unwrap();

        assert_eq!(store.get("trk-1").unwrap(), req);
        assert_eq!(store.pending_for("76543210-K", "33").unwrap(), Some(req));
        assert_eq!(store.list_pending().unwrap().len(), 1);
        assert!(matches!(store.get("nope"), Err(FolioError::NotFound { .. })));
    }

    #[test]
    fn test_second_pending_for_series_is_rejected() {
        let store = RequestStore::new(Database::memory().unwrap());
        store.insert_pending(&pending("trk-1", "33")).unwrap();
        assert!(matches!(
            store.insert_pending(&pending("trk-2", "33")),
            Err(FolioError::InvalidRequest { .. })
        ));
        store.insert_pending(&pending("trk-3", "61")).unwrap();
    }

    #[test]
    fn test_resolve_is_terminal() {
        let store = RequestStore::new(Database::memory().unwrap());
        store.insert_pending(&pending("trk-1", "33")).unwrap();
        let at = DateTime::from_timestamp_millis(1_760_000_500_000).unwrap();

        store.mark_rejected("trk-1", "quota exceeded", at).unwrap();
        let req = store.get("trk-1").unwrap();
        assert_eq!(req.status, RequestStatus::Rejected);
        assert_eq!(req.reason.as_deref(), Some("quota exceeded"));
        assert_eq!(req.resolved_at, Some(at));

        assert!(matches!(
            store.mark_accepted("trk-1", "r1", at),
            Err(FolioError::InvalidTransition { .. })
        ));

        // A new request can follow a terminal one.
        store.insert_pending(&pending("trk-2", "33")).unwrap();
        assert_eq!(store.list_for("76543210-K", "33").unwrap().len(), 2);
    }
}
