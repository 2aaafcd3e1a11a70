//! Folio allocation and authorization-range (CAF) lifecycle engine.
//!
//! Tax documents carry a sequential number ("folio") that must be unique and
//! strictly increasing per issuer and document type. Numbers come in blocks
//! pre-approved by a numbering authority, each with an expiry date. This
//! crate provides:
//!
//! - Range registration with overlap checks and all-or-nothing materialization
//! - Race-free allocation of the next number across threads and processes
//! - Background replenishment against the authority, with signed artifacts
//! - A validity watcher that expires ranges and raises early warnings
//!
//! # Quick Start
//!
//! ```no_run
//! use folio_core::{Collaborators, EngineConfig, FolioEngine};
//!
//! # async fn example() -> folio_core::FolioResult<()> {
//! let config = EngineConfig::from_env();
//! let engine = FolioEngine::open(config.clone(), Collaborators::from_config(&config)?)?;
//! let handle = engine.start()?;
//!
//! let assignment = engine.allocator().assign_next("76543210-K", "33")?;
//! println!("folio {}", assignment.folio.number);
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `FOLIO_DATABASE` | SQLite file (default: `folio.db`) |
//! | `FOLIO_LOW_WATER_THRESHOLD` | Replenish at or below this many folios (default: 100) |
//! | `FOLIO_REQUEST_QUANTITY` | Folios per replenishment request (default: 1000) |
//! | `FOLIO_NEAR_EXPIRY_DAYS` | Early-warning window (default: 15) |
//! | `FOLIO_POLL_INTERVAL_SECS` | Authority poll interval (default: 300) |
//! | `FOLIO_AUTHORITY_URL` | Authority base URL |
//! | `FOLIO_AUTHORITY_TOKEN` | Bearer token for the authority |
//! | `FOLIO_AUTHORITY_TIMEOUT` | Request timeout in seconds (default: 30) |
//! | `FOLIO_AUTHORITY_MAX_RETRIES` | Max retries for transient failures (default: 3) |

pub mod alerts;
pub mod allocator;
pub mod authority;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod folios;
pub mod lock;
pub mod model;
pub mod registry;
pub mod replenish;
pub mod requests;
pub mod storage;
pub mod verify;
pub mod watcher;

pub use alerts::{AlertEvent, AlertSink, MemoryAlertSink, TracingAlertSink};
pub use allocator::{Assignment, FolioAllocator};
pub use authority::{AuthorityClient, AuthorityStatus, HttpAuthorityClient, RangeRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthorityConfig, EngineConfig};
pub use engine::{Collaborators, EngineHandle, FolioEngine};
pub use error::{FolioError, FolioResult};
pub use folios::{FolioStore, RangeUsage, UsageReport};
pub use lock::{LockLease, LockService, SqliteLockService};
pub use model::{
    AuthorizationRange, Folio, FolioStatus, NewRange, RangeStatus, ReplenishmentRequest,
    RequestStatus, SeriesKey, Validity,
};
pub use registry::{AuthorizationRegistry, RangeFilter, RangeReport};
pub use replenish::{
    MonitorSettings, PollOutcome, ReplenishTrigger, ReplenishWorker, ReplenishmentMonitor,
    TriggerOutcome, TriggerSender,
};
pub use requests::RequestStore;
pub use storage::Database;
pub use verify::{
    sign_artifact, ArtifactVerifier, AuthorizationArtifact, Ed25519ArtifactVerifier,
    VerifiedArtifact,
};
pub use watcher::{SweepReport, ValidityWatcher};
