//! Numbering authority collaborator.
//!
//! The engine only talks to the authority through [`AuthorityClient`]; all
//! HTTP and status-code handling lives in [`http`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FolioError, FolioResult};

mod http;

pub use http::HttpAuthorityClient;

/// A request for a new authorization range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    pub issuer: String,
    pub doc_type: String,
    pub start: u64,
    pub end: u64,
}

impl RangeRequest {
    pub fn new(
        issuer: impl Into<String>,
        doc_type: impl Into<String>,
        start: u64,
        end: u64,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            doc_type: doc_type.into(),
            start,
            end,
        }
    }

    pub fn quantity(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    /// Reject requests the authority would refuse anyway.
    pub fn validate(&self, max_quantity: u64) -> FolioResult<()> {
        let invalid = |reason: String| Err(FolioError::InvalidRequest { reason });
        if self.issuer.trim().is_empty() || self.doc_type.trim().is_empty() {
            return invalid("issuer and document type are required".into());
        }
        if self.start < 1 || self.end < self.start {
            return invalid(format!("invalid bounds {}..={}", self.start, self.end));
        }
        if self.quantity() > max_quantity {
            return invalid(format!(
                "requested {} folios, maximum per request is {max_quantity}",
                self.quantity()
            ));
        }
        Ok(())
    }
}

/// Authority-side state of a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityStatus {
    Pending,
    Accepted { artifact_location: String },
    Rejected { reason: String },
}

#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Submit a range request. Returns the authority's tracking id.
    async fn submit_request(&self, request: &RangeRequest) -> FolioResult<String>;

    async fn query_status(&self, tracking_id: &str) -> FolioResult<AuthorityStatus>;

    /// Fetch the raw authorization artifact.
    async fn download(&self, artifact_location: &str) -> FolioResult<Vec<u8>>;
}
