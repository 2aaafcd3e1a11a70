//! Domain types: authorization ranges, folios, replenishment requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FolioError, FolioResult};

/// Lifecycle state of an authorization range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeStatus {
    Active,
    Expired,
    Exhausted,
}

impl RangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Exhausted => "EXHAUSTED",
        }
    }

    pub fn parse(s: &str) -> FolioResult<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            "EXHAUSTED" => Ok(Self::Exhausted),
            other => Err(FolioError::Database(format!("unknown range status: {other}"))),
        }
    }

    /// EXPIRED and EXHAUSTED never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Lifecycle state of a single folio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FolioStatus {
    Available,
    Used,
    Void,
}

impl FolioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Used => "USED",
            Self::Void => "VOID",
        }
    }

    pub fn parse(s: &str) -> FolioResult<Self> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "USED" => Ok(Self::Used),
            "VOID" => Ok(Self::Void),
            other => Err(FolioError::Database(format!("unknown folio status: {other}"))),
        }
    }
}

/// State of a replenishment request at the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    pub fn parse(s: &str) -> FolioResult<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "REJECTED" => Ok(Self::Rejected),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(FolioError::Database(format!(
                "unknown request status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Validity classification of a range relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity {
    Valid,
    NearExpiry,
    Expired,
}

/// Classify a range's validity. Returns the classification and whole days
/// left until `expires_at` (negative once expired).
pub fn classify_validity(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    near_expiry_days: i64,
) -> (Validity, i64) {
    let days = (expires_at - now).num_days();
    let validity = if expires_at <= now {
        Validity::Expired
    } else if days <= near_expiry_days {
        Validity::NearExpiry
    } else {
        Validity::Valid
    };
    (validity, days)
}

/// An (issuer, document type) pair: the unit over which folios are sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub issuer: String,
    pub doc_type: String,
}

impl SeriesKey {
    pub fn new(issuer: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            doc_type: doc_type.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.issuer, self.doc_type)
    }
}

/// One authority-approved block of folio numbers ("CAF").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRange {
    pub range_id: String,
    pub issuer: String,
    pub doc_type: String,
    /// First number (inclusive).
    pub start: u64,
    /// Last number (inclusive).
    pub end: u64,
    pub authorized_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RangeStatus,
    /// `sha256:` digest of the source authorization artifact, when ingested from one.
    #[serde(default)]
    pub artifact_hash: Option<String>,
    /// Tracking id of the replenishment request that produced this range.
    #[serde(default)]
    pub source_tracking_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub near_expiry_alerted_at: Option<DateTime<Utc>>,
}

impl AuthorizationRange {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Input to range registration.
#[derive(Debug, Clone)]
pub struct NewRange {
    pub issuer: String,
    pub doc_type: String,
    pub start: u64,
    pub end: u64,
    pub authorized_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub artifact_hash: Option<String>,
    pub source_tracking_id: Option<String>,
}

impl NewRange {
    pub fn new(
        issuer: impl Into<String>,
        doc_type: impl Into<String>,
        start: u64,
        end: u64,
        authorized_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            doc_type: doc_type.into(),
            start,
            end,
            authorized_at,
            expires_at,
            artifact_hash: None,
            source_tracking_id: None,
        }
    }

    pub fn with_artifact_hash(mut self, hash: impl Into<String>) -> Self {
        self.artifact_hash = Some(hash.into());
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.source_tracking_id = Some(tracking_id.into());
        self
    }
}

/// One individual folio number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folio {
    pub issuer: String,
    pub doc_type: String,
    pub number: u64,
    pub range_id: String,
    pub status: FolioStatus,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub voided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub void_reason: Option<String>,
}

/// Persisted record of an authority request for a new range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishmentRequest {
    pub tracking_id: String,
    pub issuer: String,
    pub doc_type: String,
    pub start: u64,
    pub end: u64,
    pub status: RequestStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub range_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReplenishmentRequest {
    pub fn quantity(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(&self.issuer, &self.doc_type)
    }
}
