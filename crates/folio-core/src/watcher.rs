//! Validity watcher: periodic sweep over authorization ranges.
//!
//! Each sweep:
//! 1. Moves ranges past their expiry to EXPIRED and raises `RANGE_EXPIRED`
//! 2. Raises `RANGE_NEAR_EXPIRY` once per range inside the warning window
//! 3. Enqueues a proactive replenishment for series whose long-lived stock
//!    is at or below the low-water mark

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEvent, AlertSink};
use crate::clock::Clock;
use crate::error::FolioResult;
use crate::folios::FolioStore;
use crate::model::{classify_validity, RangeStatus, SeriesKey, Validity};
use crate::registry::{AuthorizationRegistry, RangeFilter};
use crate::replenish::{ReplenishTrigger, TriggerSender};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// ACTIVE ranges inspected after expiry.
    pub checked: usize,
    pub expired: Vec<String>,
    pub near_expiry_alerted: Vec<String>,
    pub replenish_triggered: Vec<SeriesKey>,
}

#[derive(Clone)]
pub struct ValidityWatcher {
    registry: AuthorizationRegistry,
    folios: FolioStore,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    near_expiry_days: i64,
    threshold: u64,
    trigger: Option<TriggerSender>,
}

impl ValidityWatcher {
    pub fn new(
        registry: AuthorizationRegistry,
        folios: FolioStore,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        near_expiry_days: i64,
    ) -> Self {
        Self {
            registry,
            folios,
            alerts,
            clock,
            near_expiry_days,
            threshold: 0,
            trigger: None,
        }
    }

    /// Enable proactive replenishment for near-expiry series.
    pub fn with_replenishment(mut self, threshold: u64, trigger: TriggerSender) -> Self {
        self.threshold = threshold;
        self.trigger = Some(trigger);
        self
    }

    /// Run one sweep at the clock's current time.
    pub fn sweep(&self) -> FolioResult<SweepReport> {
        self.sweep_at(self.clock.now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> FolioResult<SweepReport> {
        let mut report = SweepReport::default();

        for range in self.registry.expire_sweep(now)? {
            let remaining = self
                .registry
                .range_status(&range.range_id, now, self.near_expiry_days)?
                .available;
            self.alerts.emit(AlertEvent::RangeExpired {
                issuer: range.issuer.clone(),
                doc_type: range.doc_type.clone(),
                range_id: range.range_id.clone(),
                remaining,
            });
            report.expired.push(range.range_id);
        }

        let active = self
            .registry
            .list_ranges(&RangeFilter::default().with_status(RangeStatus::Active))?;
        report.checked = active.len();

        let mut near_expiry_series = BTreeSet::new();
        for range in active {
            let (validity, days) = classify_validity(range.expires_at, now, self.near_expiry_days);
            if validity != Validity::NearExpiry {
                continue;
            }
            near_expiry_series.insert((range.issuer.clone(), range.doc_type.clone()));

            if !self.registry.mark_near_expiry_alerted(&range.range_id, now)? {
                continue;
            }
            let remaining = self
                .registry
                .range_status(&range.range_id, now, self.near_expiry_days)?
                .available;
            self.alerts.emit(AlertEvent::RangeNearExpiry {
                issuer: range.issuer.clone(),
                doc_type: range.doc_type.clone(),
                range_id: range.range_id.clone(),
                days_to_expiry: days,
                remaining,
            });
            report.near_expiry_alerted.push(range.range_id);
        }

        if let Some(trigger) = &self.trigger {
            let cutoff = now + ChronoDuration::days(self.near_expiry_days);
            for (issuer, doc_type) in near_expiry_series {
                let lasting = self.folios.count_available_beyond(&issuer, &doc_type, cutoff)?;
                if lasting > self.threshold {
                    continue;
                }
                // The trigger compares the current count against its threshold,
                // so pass the current count to force a request.
                let current = self.folios.count_available(&issuer, &doc_type, now)?;
                info!(
                    issuer = %issuer,
                    doc_type = %doc_type,
                    lasting,
                    current,
                    "proactive replenishment for near-expiry series"
                );
                trigger.send(ReplenishTrigger::new(
                    issuer.clone(),
                    doc_type.clone(),
                    current.max(self.threshold),
                ));
                report
                    .replenish_triggered
                    .push(SeriesKey::new(issuer, doc_type));
            }
        }

        debug!(
            checked = report.checked,
            expired = report.expired.len(),
            near_expiry = report.near_expiry_alerted.len(),
            "validity sweep finished"
        );
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `every` until the returned token is cancelled.
    pub fn spawn(self, every: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            self.run(every, cancel_clone).await;
        });
        cancel
    }

    pub async fn run(self, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = every.as_secs(), "validity watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("validity watcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep() {
                        warn!(error = %e, "validity sweep failed");
                    }
                }
            }
        }
    }
}
