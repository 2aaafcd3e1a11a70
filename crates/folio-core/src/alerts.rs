//! Operator alerts.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, warn};

/// Structured alert raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertEvent {
    RangeNearExpiry {
        issuer: String,
        doc_type: String,
        range_id: String,
        days_to_expiry: i64,
        remaining: u64,
    },
    RangeExpired {
        issuer: String,
        doc_type: String,
        range_id: String,
        /// AVAILABLE folios lost with the range.
        remaining: u64,
    },
    ReplenishmentRejected {
        issuer: String,
        doc_type: String,
        tracking_id: String,
        reason: String,
    },
    ReplenishmentTimedOut {
        issuer: String,
        doc_type: String,
        tracking_id: String,
    },
    IngestionFailed {
        issuer: String,
        doc_type: String,
        tracking_id: String,
        reason: String,
    },
    FoliosExhausted {
        issuer: String,
        doc_type: String,
    },
}

impl AlertEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RangeNearExpiry { .. } => "RANGE_NEAR_EXPIRY",
            Self::RangeExpired { .. } => "RANGE_EXPIRED",
            Self::ReplenishmentRejected { .. } => "REPLENISHMENT_REJECTED",
            Self::ReplenishmentTimedOut { .. } => "REPLENISHMENT_TIMED_OUT",
            Self::IngestionFailed { .. } => "INGESTION_FAILED",
            Self::FoliosExhausted { .. } => "FOLIOS_EXHAUSTED",
        }
    }

    pub fn issuer(&self) -> &str {
        match self {
            Self::RangeNearExpiry { issuer, .. }
            | Self::RangeExpired { issuer, .. }
            | Self::ReplenishmentRejected { issuer, .. }
            | Self::ReplenishmentTimedOut { issuer, .. }
            | Self::IngestionFailed { issuer, .. }
            | Self::FoliosExhausted { issuer, .. } => issuer,
        }
    }

    pub fn doc_type(&self) -> &str {
        match self {
            Self::RangeNearExpiry { doc_type, .. }
            | Self::RangeExpired { doc_type, .. }
            | Self::ReplenishmentRejected { doc_type, .. }
            | Self::ReplenishmentTimedOut { doc_type, .. }
            | Self::IngestionFailed { doc_type, .. }
            | Self::FoliosExhausted { doc_type, .. } => doc_type,
        }
    }
}

/// Receives alerts. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: AlertEvent);
}

/// Emits alerts as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: AlertEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            AlertEvent::FoliosExhausted { .. } | AlertEvent::RangeExpired { .. } => error!(
                kind = event.kind(),
                issuer = event.issuer(),
                doc_type = event.doc_type(),
                alert = %payload,
                "folio alert"
            ),
            _ => warn!(
                kind = event.kind(),
                issuer = event.issuer(),
                doc_type = event.doc_type(),
                alert = %payload,
                "folio alert"
            ),
        }
    }
}

/// Collects alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl AlertSink for MemoryAlertSink {
    fn emit(&self, event: AlertEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}
