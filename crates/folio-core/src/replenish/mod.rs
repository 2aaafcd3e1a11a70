//! Replenishment monitor: requests new ranges from the authority and
//! ingests them once approved.
//!
//! A request-scoped lease keyed by series guards the whole lifecycle of a
//! request, from submission to its terminal state. The lease is renewed on
//! every poll tick and released on every exit path; a crashed holder simply
//! lets it expire, after which [`ReplenishmentMonitor::poll_status`] can pick
//! the PENDING request up again.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEvent, AlertSink};
use crate::authority::{AuthorityClient, AuthorityStatus, RangeRequest};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{FolioError, FolioResult};
use crate::folios::FolioStore;
use crate::lock::{LockLease, LockService};
use crate::model::{AuthorizationRange, NewRange, ReplenishmentRequest, RequestStatus};
use crate::registry::AuthorizationRegistry;
use crate::requests::RequestStore;
use crate::verify::ArtifactVerifier;

pub mod worker;

pub use worker::{trigger_channel, ReplenishTrigger, ReplenishWorker, TriggerSender};

/// Lock key guarding replenishment of one series.
pub fn replenish_lock_key(issuer: &str, doc_type: &str) -> String {
    format!("replenish:{issuer}:{doc_type}")
}

/// Ingestion errors worth another tick. Storage failures are retried until the
/// poll deadline; verification, bounds and overlap failures close the request.
fn retry_ingestion(err: &FolioError) -> bool {
    err.is_retryable() || matches!(err, FolioError::Database(_))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub request_quantity: u64,
    pub max_range_size: u64,
    pub lock_ttl: Duration,
    pub poll_timeout: Duration,
}

impl From<&EngineConfig> for MonitorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            request_quantity: config.request_quantity,
            max_range_size: config.max_range_size,
            lock_ttl: config.request_lock_ttl(),
            poll_timeout: config.poll_timeout(),
        }
    }
}

/// Result of [`ReplenishmentMonitor::trigger_if_low`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Another caller holds the series lease.
    AlreadyInFlight,
    AboveThreshold { remaining: u64 },
    /// A request was already PENDING; the lease is held for resuming its poll.
    PendingExists {
        request: ReplenishmentRequest,
        lease: LockLease,
    },
    /// A new request was submitted; the lease is held for its poll.
    Submitted {
        request: ReplenishmentRequest,
        lease: LockLease,
    },
}

/// Result of polling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ingested {
        request: ReplenishmentRequest,
        range: AuthorizationRange,
    },
    /// The request was already terminal.
    AlreadyResolved { request: ReplenishmentRequest },
    /// Polling stopped on cancellation; the request stays PENDING.
    Cancelled,
}

#[derive(Clone)]
pub struct ReplenishmentMonitor {
    registry: AuthorizationRegistry,
    folios: FolioStore,
    requests: RequestStore,
    locks: Arc<dyn LockService>,
    authority: Arc<dyn AuthorityClient>,
    verifier: Arc<dyn ArtifactVerifier>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    settings: MonitorSettings,
}

impl ReplenishmentMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: AuthorizationRegistry,
        folios: FolioStore,
        requests: RequestStore,
        locks: Arc<dyn LockService>,
        authority: Arc<dyn AuthorityClient>,
        verifier: Arc<dyn ArtifactVerifier>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            folios,
            requests,
            locks,
            authority,
            verifier,
            alerts,
            clock,
            settings,
        }
    }

    pub fn requests(&self) -> &RequestStore {
        &self.requests
    }

    /// Submit a replenishment request if the series is at or below `threshold`.
    ///
    /// Idempotent across callers and processes: only the holder of the series
    /// lease proceeds, and an existing PENDING request is returned instead of
    /// submitting another one.
    pub async fn trigger_if_low(
        &self,
        issuer: &str,
        doc_type: &str,
        threshold: u64,
    ) -> FolioResult<TriggerOutcome> {
        let key = replenish_lock_key(issuer, doc_type);
        let lease = match self.locks.acquire(&key, self.settings.lock_ttl) {
            Ok(lease) => lease,
            Err(FolioError::LockBusy { .. }) => {
                debug!(issuer, doc_type, "replenishment already in flight");
                return Ok(TriggerOutcome::AlreadyInFlight);
            }
            Err(e) => return Err(e),
        };

        let outcome = self
            .trigger_with_lease(issuer, doc_type, threshold, lease.clone())
            .await;

        match &outcome {
            Ok(TriggerOutcome::AboveThreshold { .. }) | Err(_) => self.release(&lease),
            _ => {}
        }
        outcome
    }

    async fn trigger_with_lease(
        &self,
        issuer: &str,
        doc_type: &str,
        threshold: u64,
        lease: LockLease,
    ) -> FolioResult<TriggerOutcome> {
        if let Some(request) = self.requests.pending_for(issuer, doc_type)? {
            debug!(issuer, doc_type, tracking_id = %request.tracking_id, "pending request exists");
            return Ok(TriggerOutcome::PendingExists { request, lease });
        }

        let now = self.clock.now();
        let remaining = self.folios.count_available(issuer, doc_type, now)?;
        if remaining > threshold {
            return Ok(TriggerOutcome::AboveThreshold { remaining });
        }

        let start = match self.folios.max_number(issuer, doc_type)? {
            Some(max) => max + 1,
            None => 1,
        };
        let end = start
            .checked_add(self.settings.request_quantity.saturating_sub(1))
            .ok_or_else(|| FolioError::InvalidRequest {
                reason: "requested range exceeds numbering space".into(),
            })?;
        let range_request = RangeRequest::new(issuer, doc_type, start, end);
        range_request.validate(self.settings.max_range_size)?;

        let tracking_id = self.authority.submit_request(&range_request).await?;

        let request = ReplenishmentRequest {
            tracking_id: tracking_id.clone(),
            issuer: issuer.to_string(),
            doc_type: doc_type.to_string(),
            start,
            end,
            status: RequestStatus::Pending,
            reason: None,
            range_id: None,
            requested_at: now,
            resolved_at: None,
        };
        if let Err(e) = self.requests.insert_pending(&request) {
            error!(
                issuer,
                doc_type,
                tracking_id = %tracking_id,
                error = %e,
                "authority accepted a request that could not be recorded"
            );
            return Err(e);
        }

        info!(
            issuer,
            doc_type,
            tracking_id = %tracking_id,
            start,
            end,
            remaining,
            "replenishment requested"
        );
        Ok(TriggerOutcome::Submitted { request, lease })
    }

    /// Poll a PENDING request until it resolves, times out, or `cancel` fires.
    pub async fn poll_status(
        &self,
        tracking_id: &str,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> FolioResult<PollOutcome> {
        let request = self.requests.get(tracking_id)?;
        if request.status.is_terminal() {
            return Ok(PollOutcome::AlreadyResolved { request });
        }
        let lease = self.locks.acquire(
            &replenish_lock_key(&request.issuer, &request.doc_type),
            self.settings.lock_ttl,
        )?;
        self.poll_with_lease(request, lease, interval, cancel).await
    }

    /// Poll loop for a request whose series lease is already held. The lease
    /// is released on every exit.
    pub async fn poll_with_lease(
        &self,
        request: ReplenishmentRequest,
        mut lease: LockLease,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> FolioResult<PollOutcome> {
        let outcome = self
            .poll_until_resolved(&request, &mut lease, interval, cancel)
            .await;
        self.release(&lease);
        outcome
    }

    async fn poll_until_resolved(
        &self,
        request: &ReplenishmentRequest,
        lease: &mut LockLease,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> FolioResult<PollOutcome> {
        let tracking_id = request.tracking_id.clone();
        let deadline = request.requested_at
            + ChronoDuration::from_std(self.settings.poll_timeout)
                .unwrap_or_else(|_| ChronoDuration::days(1));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(tracking_id = %tracking_id, "replenishment poll cancelled");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = tokio::time::sleep(interval) => {}
            }

            *lease = self.locks.renew(lease, self.settings.lock_ttl)?;

            let now = self.clock.now();
            if now >= deadline {
                self.requests.mark_timed_out(&tracking_id, now)?;
                warn!(tracking_id = %tracking_id, "replenishment request timed out");
                self.alerts.emit(AlertEvent::ReplenishmentTimedOut {
                    issuer: request.issuer.clone(),
                    doc_type: request.doc_type.clone(),
                    tracking_id: tracking_id.clone(),
                });
                return Err(FolioError::AuthorityTimeout { tracking_id });
            }

            let status = match self.authority.query_status(&tracking_id).await {
                Ok(status) => status,
                Err(e) if e.is_retryable() => {
                    warn!(tracking_id = %tracking_id, error = %e, "status query failed, will retry");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match status {
                AuthorityStatus::Pending => {
                    debug!(tracking_id = %tracking_id, "request still pending");
                }
                AuthorityStatus::Rejected { reason } => {
                    self.requests.mark_rejected(&tracking_id, &reason, now)?;
                    warn!(tracking_id = %tracking_id, reason = %reason, "replenishment rejected");
                    self.alerts.emit(AlertEvent::ReplenishmentRejected {
                        issuer: request.issuer.clone(),
                        doc_type: request.doc_type.clone(),
                        tracking_id: tracking_id.clone(),
                        reason: reason.clone(),
                    });
                    return Err(FolioError::AuthorityRejected {
                        tracking_id,
                        reason,
                    });
                }
                AuthorityStatus::Accepted { artifact_location } => {
                    match self.ingest(request, &artifact_location).await {
                        Ok(range) => {
                            let request = self.requests.get(&tracking_id)?;
                            return Ok(PollOutcome::Ingested { request, range });
                        }
                        Err(e) if retry_ingestion(&e) => {
                            warn!(tracking_id = %tracking_id, error = %e, "ingestion failed, will retry");
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            error!(tracking_id = %tracking_id, error = %reason, "ingestion failed");
                            self.requests.mark_rejected(&tracking_id, &reason, self.clock.now())?;
                            self.alerts.emit(AlertEvent::IngestionFailed {
                                issuer: request.issuer.clone(),
                                doc_type: request.doc_type.clone(),
                                tracking_id: tracking_id.clone(),
                                reason,
                            });
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Download, verify and register an accepted artifact.
    async fn ingest(
        &self,
        request: &ReplenishmentRequest,
        artifact_location: &str,
    ) -> FolioResult<AuthorizationRange> {
        let raw = self.authority.download(artifact_location).await?;
        let verified =
            self.verifier
                .verify(&raw, &request.issuer, &request.doc_type, self.clock.now())?;

        if verified.start != request.start || verified.end != request.end {
            return Err(FolioError::InvalidArtifact {
                reason: format!(
                    "artifact covers {}..={}, request was {}..={}",
                    verified.start, verified.end, request.start, request.end
                ),
            });
        }

        let new_range = NewRange::new(
            &request.issuer,
            &request.doc_type,
            verified.start,
            verified.end,
            verified.authorized_at,
            verified.expires_at,
        )
        .with_artifact_hash(verified.hash)
        .with_tracking_id(&request.tracking_id);

        let range = match self.registry.register_range(new_range) {
            Ok(range) => range,
            // Registered by an earlier attempt that died before resolving the request.
            Err(FolioError::RangeOverlap {
                existing_range_id, ..
            }) if self.is_from_request(&existing_range_id, &request.tracking_id)? => {
                self.registry.get_range(&existing_range_id)?
            }
            Err(e) => return Err(e),
        };

        self.requests
            .mark_accepted(&request.tracking_id, &range.range_id, self.clock.now())?;
        info!(
            tracking_id = %request.tracking_id,
            range_id = %range.range_id,
            start = range.start,
            end = range.end,
            "replenishment ingested"
        );
        Ok(range)
    }

    fn is_from_request(&self, range_id: &str, tracking_id: &str) -> FolioResult<bool> {
        let range = self.registry.get_range(range_id)?;
        Ok(range.source_tracking_id.as_deref() == Some(tracking_id))
    }

    /// Every PENDING request, oldest first.
    pub fn pending_requests(&self) -> FolioResult<Vec<ReplenishmentRequest>> {
        self.requests.list_pending()
    }

    fn release(&self, lease: &LockLease) {
        if let Err(e) = self.locks.release(lease) {
            warn!(key = %lease.key, error = %e, "failed to release replenishment lease");
        }
    }
}
