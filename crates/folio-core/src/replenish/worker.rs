//! Background replenishment worker fed by a non-blocking trigger queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PollOutcome, ReplenishmentMonitor, TriggerOutcome};
use crate::error::FolioResult;
use crate::lock::LockLease;
use crate::model::ReplenishmentRequest;

/// A request to check (and if needed replenish) one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplenishTrigger {
    pub issuer: String,
    pub doc_type: String,
    pub threshold: u64,
}

impl ReplenishTrigger {
    pub fn new(issuer: impl Into<String>, doc_type: impl Into<String>, threshold: u64) -> Self {
        Self {
            issuer: issuer.into(),
            doc_type: doc_type.into(),
            threshold,
        }
    }
}

/// Sending half of the trigger queue. Sending never blocks.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::UnboundedSender<ReplenishTrigger>,
}

impl TriggerSender {
    pub fn send(&self, trigger: ReplenishTrigger) {
        if self.tx.send(trigger).is_err() {
            debug!("replenishment worker stopped, trigger dropped");
        }
    }
}

pub fn trigger_channel() -> (TriggerSender, mpsc::UnboundedReceiver<ReplenishTrigger>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TriggerSender { tx }, rx)
}

/// Consumes triggers, runs [`ReplenishmentMonitor::trigger_if_low`] and
/// spawns a poll for every request it ends up holding.
#[derive(Clone)]
pub struct ReplenishWorker {
    monitor: Arc<ReplenishmentMonitor>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl ReplenishWorker {
    pub fn new(
        monitor: Arc<ReplenishmentMonitor>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            monitor,
            poll_interval,
            cancel,
        }
    }

    /// Spawn the worker loop.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<ReplenishTrigger>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<ReplenishTrigger>) {
        info!("replenishment worker started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => self.handle(trigger).await,
                    None => break,
                },
            }
        }
        info!("replenishment worker stopped");
    }

    async fn handle(&self, trigger: ReplenishTrigger) {
        let outcome = self
            .monitor
            .trigger_if_low(&trigger.issuer, &trigger.doc_type, trigger.threshold)
            .await;

        match outcome {
            Ok(TriggerOutcome::Submitted { request, lease })
            | Ok(TriggerOutcome::PendingExists { request, lease }) => {
                self.spawn_poll(request, lease);
            }
            Ok(TriggerOutcome::AlreadyInFlight) => {
                debug!(issuer = %trigger.issuer, doc_type = %trigger.doc_type, "trigger coalesced");
            }
            Ok(TriggerOutcome::AboveThreshold { remaining }) => {
                debug!(
                    issuer = %trigger.issuer,
                    doc_type = %trigger.doc_type,
                    remaining,
                    "no replenishment needed"
                );
            }
            Err(e) => {
                warn!(
                    issuer = %trigger.issuer,
                    doc_type = %trigger.doc_type,
                    error = %e,
                    "replenishment trigger failed"
                );
            }
        }
    }

    fn spawn_poll(&self, request: ReplenishmentRequest, lease: LockLease) {
        let monitor = self.monitor.clone();
        let cancel = self.cancel.child_token();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let tracking_id = request.tracking_id.clone();
            let result = monitor
                .poll_with_lease(request, lease, interval, &cancel)
                .await;
            log_poll_result(&tracking_id, result);
        });
    }

    /// Resume polling of every PENDING request, e.g. after a restart.
    /// Must run inside a tokio runtime. A request whose lease is still held
    /// elsewhere ends its poll with `LockBusy`.
    pub fn resume_pending(&self) -> FolioResult<usize> {
        let pending = self.monitor.pending_requests()?;
        for request in &pending {
            let monitor = self.monitor.clone();
            let cancel = self.cancel.child_token();
            let interval = self.poll_interval;
            let tracking_id = request.tracking_id.clone();
            tokio::spawn(async move {
                let result = monitor.poll_status(&tracking_id, interval, &cancel).await;
                log_poll_result(&tracking_id, result);
            });
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "resumed pending replenishment requests");
        }
        Ok(pending.len())
    }
}

fn log_poll_result(tracking_id: &str, result: FolioResult<PollOutcome>) {
    match result {
        Ok(PollOutcome::Ingested { range, .. }) => {
            info!(tracking_id, range_id = %range.range_id, "replenishment complete");
        }
        Ok(PollOutcome::AlreadyResolved { request }) => {
            debug!(tracking_id, status = request.status.as_str(), "request already resolved");
        }
        Ok(PollOutcome::Cancelled) => debug!(tracking_id, "poll cancelled"),
        Err(e) => warn!(tracking_id, error = %e, "replenishment poll ended with error"),
    }
}
