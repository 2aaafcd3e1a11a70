//! Engine facade: wires storage, allocator, replenishment and watcher from
//! one [`EngineConfig`].

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alerts::{AlertSink, TracingAlertSink};
use crate::allocator::FolioAllocator;
use crate::authority::{AuthorityClient, HttpAuthorityClient};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{FolioError, FolioResult};
use crate::folios::FolioStore;
use crate::lock::{LockService, SqliteLockService};
use crate::registry::AuthorizationRegistry;
use crate::replenish::{
    trigger_channel, MonitorSettings, ReplenishTrigger, ReplenishWorker, ReplenishmentMonitor,
};
use crate::requests::RequestStore;
use crate::storage::Database;
use crate::verify::{ArtifactVerifier, Ed25519ArtifactVerifier};
use crate::watcher::ValidityWatcher;

/// External collaborators of the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub authority: Arc<dyn AuthorityClient>,
    pub verifier: Arc<dyn ArtifactVerifier>,
    pub alerts: Arc<dyn AlertSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Tracing alerts and the wall clock.
    pub fn new(authority: Arc<dyn AuthorityClient>, verifier: Arc<dyn ArtifactVerifier>) -> Self {
        Self {
            authority,
            verifier,
            alerts: Arc::new(TracingAlertSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// HTTP authority and PEM-configured verifier from `config`.
    pub fn from_config(config: &EngineConfig) -> FolioResult<Self> {
        let authority = HttpAuthorityClient::new(config.authority.clone())?;
        let verifier =
            Ed25519ArtifactVerifier::from_pem_files(&config.trusted_keys, config.validity_months)?;
        Ok(Self::new(Arc::new(authority), Arc::new(verifier)))
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct FolioEngine {
    config: EngineConfig,
    registry: AuthorizationRegistry,
    folios: FolioStore,
    allocator: FolioAllocator,
    monitor: Arc<ReplenishmentMonitor>,
    watcher: ValidityWatcher,
    locks: Arc<SqliteLockService>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplenishTrigger>>>,
}

impl FolioEngine {
    /// Open the configured database file.
    pub fn open(config: EngineConfig, collaborators: Collaborators) -> FolioResult<Self> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        Self::with_database(config, db, collaborators)
    }

    pub fn with_database(
        config: EngineConfig,
        db: Database,
        collaborators: Collaborators,
    ) -> FolioResult<Self> {
        config.validate()?;
        let Collaborators {
            authority,
            verifier,
            alerts,
            clock,
        } = collaborators;

        let (trigger, trigger_rx) = trigger_channel();
        let registry = AuthorizationRegistry::new(db.clone(), clock.clone(), config.max_range_size);
        let folios = FolioStore::new(db.clone(), clock.clone()).with_alerts(alerts.clone());
        let requests = RequestStore::new(db.clone());
        let locks = Arc::new(SqliteLockService::new(db.clone(), clock.clone()));

        let allocator = FolioAllocator::new(db, clock.clone())
            .with_replenishment(config.low_water_threshold, trigger.clone())
            .with_alerts(alerts.clone());

        let monitor = Arc::new(ReplenishmentMonitor::new(
            registry.clone(),
            folios.clone(),
            requests,
            locks.clone() as Arc<dyn LockService>,
            authority,
            verifier,
            alerts.clone(),
            clock.clone(),
            MonitorSettings::from(&config),
        ));

        let watcher = ValidityWatcher::new(
            registry.clone(),
            folios.clone(),
            alerts,
            clock,
            config.near_expiry_days,
        )
        .with_replenishment(config.low_water_threshold, trigger);

        Ok(Self {
            config,
            registry,
            folios,
            allocator,
            monitor,
            watcher,
            locks,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AuthorizationRegistry {
        &self.registry
    }

    pub fn folios(&self) -> &FolioStore {
        &self.folios
    }

    pub fn allocator(&self) -> &FolioAllocator {
        &self.allocator
    }

    pub fn monitor(&self) -> &Arc<ReplenishmentMonitor> {
        &self.monitor
    }

    pub fn requests(&self) -> &RequestStore {
        self.monitor.requests()
    }

    pub fn watcher(&self) -> &ValidityWatcher {
        &self.watcher
    }

    pub fn locks(&self) -> &SqliteLockService {
        &self.locks
    }

    /// Start the replenishment worker and the validity watcher.
    ///
    /// PENDING requests left by a previous run are resumed first. Can only be
    /// called once per engine.
    pub fn start(&self) -> FolioResult<EngineHandle> {
        let rx = self
            .trigger_rx
            .lock()
            .map_err(|_| FolioError::Database("trigger queue mutex poisoned".to_string()))?
            .take()
            .ok_or_else(|| FolioError::InvalidRequest {
                reason: "engine already started".to_string(),
            })?;

        let cancel = CancellationToken::new();
        let worker = ReplenishWorker::new(
            self.monitor.clone(),
            self.config.poll_interval(),
            cancel.child_token(),
        );
        let resumed = worker.resume_pending()?;
        let worker_task = worker.spawn(rx);

        let watcher = self.watcher.clone();
        let watcher_cancel = cancel.child_token();
        let every = self.config.watcher_interval();
        let watcher_task = tokio::spawn(async move { watcher.run(every, watcher_cancel).await });

        info!(
            resumed,
            poll_interval_secs = self.config.poll_interval_secs,
            watcher_interval_secs = self.config.watcher_interval_secs,
            "folio engine started"
        );
        Ok(EngineHandle {
            cancel,
            tasks: vec![worker_task, watcher_task],
        })
    }
}

/// Running background tasks of a started engine.
#[derive(Debug)]
pub struct EngineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the worker, the watcher and every in-flight poll, then wait for
    /// the loops to exit. PENDING requests stay PENDING.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("folio engine stopped");
    }
}
