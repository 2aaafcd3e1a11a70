//! Error types for the folio engine.

use chrono::{DateTime, Utc};

/// Folio engine errors.
///
/// Allocation-path variants (`NoFolioAvailable`, `CafExpired`) surface to the
/// document-creation caller; replenishment-path variants are reported through
/// the alert sink by the background worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FolioError {
    /// Lock is held by another caller.
    #[error("lock busy: {key}")]
    LockBusy { key: String },

    /// Lease expired or was taken over before renewal.
    #[error("lock lost: {key}")]
    LockLost { key: String },

    /// New range overlaps an existing range or existing folio numbers.
    #[error("range {start}..={end} for {issuer}/{doc_type} overlaps existing range {existing_range_id}")]
    RangeOverlap {
        issuer: String,
        doc_type: String,
        start: u64,
        end: u64,
        existing_range_id: String,
    },

    /// Range bounds or validity window are malformed.
    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },

    /// No AVAILABLE folio in any ACTIVE range.
    #[error("no folio available for {issuer}/{doc_type}")]
    NoFolioAvailable { issuer: String, doc_type: String },

    /// The only ranges still holding folios are expired.
    #[error("authorization range {range_id} for {issuer}/{doc_type} expired at {expired_at}")]
    CafExpired {
        issuer: String,
        doc_type: String,
        range_id: String,
        expired_at: DateTime<Utc>,
    },

    /// Authority rejected the replenishment request.
    #[error("authority rejected request {tracking_id}: {reason}")]
    AuthorityRejected { tracking_id: String, reason: String },

    /// Authority did not resolve the request before the poll deadline.
    #[error("authority did not resolve request {tracking_id} in time")]
    AuthorityTimeout { tracking_id: String },

    /// Transport-level failure talking to the authority.
    #[error("authority unavailable: {message}")]
    AuthorityUnavailable { message: String },

    /// Artifact signature verification failed.
    #[error("signature verification failed: {reason}")]
    SignatureInvalid { reason: String },

    /// Artifact was issued for a different issuer.
    #[error("issuer mismatch: expected {expected}, artifact has {actual}")]
    IssuerMismatch { expected: String, actual: String },

    /// Artifact body is malformed or does not match the request.
    #[error("invalid artifact: {reason}")]
    InvalidArtifact { reason: String },

    /// Attempted a state transition the state machine forbids.
    #[error("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("database error: {0}")]
    Database(String),
}

impl FolioError {
    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Caller / input issues
            Self::InvalidRange { .. } => 1,
            Self::InvalidRequest { .. } => 1,
            Self::NotFound { .. } => 1,
            Self::Config { .. } => 1,
            Self::InvalidTransition { .. } => 1,

            // Out of numbers
            Self::NoFolioAvailable { .. } => 2,
            Self::CafExpired { .. } => 3,

            // Integrity / security
            Self::RangeOverlap { .. } => 4,
            Self::SignatureInvalid { .. } => 4,
            Self::IssuerMismatch { .. } => 4,
            Self::InvalidArtifact { .. } => 4,

            // Authority outcome
            Self::AuthorityRejected { .. } => 5,
            Self::AuthorityTimeout { .. } => 6,

            // Transient
            Self::LockBusy { .. } => 6,
            Self::LockLost { .. } => 6,
            Self::AuthorityUnavailable { .. } => 6,

            Self::Database(_) => 7,
        }
    }

    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockBusy { .. }
                | Self::LockLost { .. }
                | Self::AuthorityTimeout { .. }
                | Self::AuthorityUnavailable { .. }
        )
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl From<rusqlite::Error> for FolioError {
    fn from(e: rusqlite::Error) -> Self {
        FolioError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for FolioError {
    fn from(err: reqwest::Error) -> Self {
        Self::AuthorityUnavailable {
            message: err.to_string(),
        }
    }
}

/// Result type for folio operations.
pub type FolioResult<T> = Result<T, FolioError>;
