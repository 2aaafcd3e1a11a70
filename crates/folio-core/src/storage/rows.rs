//! Raw row shapes and their conversion into domain types.
//!
//! Row mappers run inside rusqlite closures that can only fail with
//! `rusqlite::Error`, so they read plain column values; timestamp and status
//! decoding happens afterwards in `TryFrom`.

use rusqlite::Row;

use super::{from_ms, from_ms_opt};
use crate::error::FolioError;
use crate::model::{
    AuthorizationRange, Folio, FolioStatus, RangeStatus, ReplenishmentRequest, RequestStatus,
};

pub(crate) const RANGE_COLUMNS: &str = "range_id, issuer, doc_type, start_number, end_number, \
     authorized_at_ms, expires_at_ms, status, artifact_hash, source_tracking_id, \
     registered_at_ms, near_expiry_alerted_at_ms";

pub(crate) const FOLIO_COLUMNS: &str = "issuer, doc_type, number, range_id, status, used_at_ms, \
     document_id, voided_at_ms, void_reason";

pub(crate) const REQUEST_COLUMNS: &str = "tracking_id, issuer, doc_type, start_number, \
     end_number, status, reason, range_id, requested_at_ms, resolved_at_ms";

#[derive(Debug, Clone)]
pub(crate) struct RangeRow {
    pub range_id: String,
    pub issuer: String,
    pub doc_type: String,
    pub start_number: i64,
    pub end_number: i64,
    pub authorized_at_ms: i64,
    pub expires_at_ms: i64,
    pub status: String,
    pub artifact_hash: Option<String>,
    pub source_tracking_id: Option<String>,
    pub registered_at_ms: i64,
    pub near_expiry_alerted_at_ms: Option<i64>,
}

impl RangeRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            range_id: row.get(0)?,
            issuer: row.get(1)?,
            doc_type: row.get(2)?,
            start_number: row.get(3)?,
            end_number: row.get(4)?,
            authorized_at_ms: row.get(5)?,
            expires_at_ms: row.get(6)?,
            status: row.get(7)?,
            artifact_hash: row.get(8)?,
            source_tracking_id: row.get(9)?,
            registered_at_ms: row.get(10)?,
            near_expiry_alerted_at_ms: row.get(11)?,
        })
    }
}

impl TryFrom<RangeRow> for AuthorizationRange {
    type Error = FolioError;

    fn try_from(r: RangeRow) -> Result<Self, Self::Error> {
        Ok(AuthorizationRange {
            range_id: r.range_id,
            issuer: r.issuer,
            doc_type: r.doc_type,
            start: r.start_number as u64,
            end: r.end_number as u64,
            authorized_at: from_ms(r.authorized_at_ms)?,
            expires_at: from_ms(r.expires_at_ms)?,
            status: RangeStatus::parse(&r.status)?,
            artifact_hash: r.artifact_hash,
            source_tracking_id: r.source_tracking_id,
            registered_at: from_ms(r.registered_at_ms)?,
            near_expiry_alerted_at: from_ms_opt(r.near_expiry_alerted_at_ms)?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FolioRow {
    pub issuer: String,
    pub doc_type: String,
    pub number: i64,
    pub range_id: String,
    pub status: String,
    pub used_at_ms: Option<i64>,
    pub document_id: Option<String>,
    pub voided_at_ms: Option<i64>,
    pub void_reason: Option<String>,
}

impl FolioRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            issuer: row.get(0)?,
            doc_type: row.get(1)?,
            number: row.get(2)?,
            range_id: row.get(3)?,
            status: row.get(4)?,
            used_at_ms: row.get(5)?,
            document_id: row.get(6)?,
            voided_at_ms: row.get(7)?,
            void_reason: row.get(8)?,
        })
    }
}

impl TryFrom<FolioRow> for Folio {
    type Error = FolioError;

    fn try_from(r: FolioRow) -> Result<Self, Self::Error> {
        Ok(Folio {
            issuer: r.issuer,
            doc_type: r.doc_type,
            number: r.number as u64,
            range_id: r.range_id,
            status: FolioStatus::parse(&r.status)?,
            used_at: from_ms_opt(r.used_at_ms)?,
            document_id: r.document_id,
            voided_at: from_ms_opt(r.voided_at_ms)?,
            void_reason: r.void_reason,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RequestRow {
    pub tracking_id: String,
    pub issuer: String,
    pub doc_type: String,
    pub start_number: i64,
    pub end_number: i64,
    pub status: String,
    pub reason: Option<String>,
    pub range_id: Option<String>,
    pub requested_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
}

impl RequestRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tracking_id: row.get(0)?,
            issuer: row.get(1)?,
            doc_type: row.get(2)?,
            start_number: row.get(3)?,
            end_number: row.get(4)?,
            status: row.get(5)?,
            reason: row.get(6)?,
            range_id: row.get(7)?,
            requested_at_ms: row.get(8)?,
            resolved_at_ms: row.get(9)?,
        })
    }
}

impl TryFrom<RequestRow> for ReplenishmentRequest {
    type Error = FolioError;

    fn try_from(r: RequestRow) -> Result<Self, Self::Error> {
        Ok(ReplenishmentRequest {
            tracking_id: r.tracking_id,
            issuer: r.issuer,
            doc_type: r.doc_type,
            start: r.start_number as u64,
            end: r.end_number as u64,
            status: RequestStatus::parse(&r.status)?,
            reason: r.reason,
            range_id: r.range_id,
            requested_at: from_ms(r.requested_at_ms)?,
            resolved_at: from_ms_opt(r.resolved_at_ms)?,
        })
    }
}

/// Collect mapped rows and convert each into its domain type.
pub(crate) fn collect_rows<R, T>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
) -> Result<Vec<T>, FolioError>
where
    T: TryFrom<R, Error = FolioError>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(T::try_from(row?)?);
    }
    Ok(out)
}
