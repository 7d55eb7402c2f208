//! Lifecycle manager.
//!
//! Sequences creation, control and teardown of servers across the config
//! store, the port allocator and the container engine, and reconciles
//! observed container state into stored status on every read.
//!
//! Every mutating operation on a server holds that server's lock for its
//! whole duration; the asynchronous launch inherits the lock taken by
//! `create_server`. The lock is also a file lock under the data directory,
//! so separate processes sharing the database exclude each other too.
//! Different servers never contend.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use gamectl_core::Config;

use super::ids::{IdGenerator, generate_secret};
use super::locks::{ServerGuard, ServerLocks};
use super::reconcile::{CONTAINER_MISSING, Observation, reconcile};
use super::template::palworld_spec;
use super::types::{
    ActionOutcome, ActionStatus, CreatedServer, HealthReport, LifecycleError, NewServer,
    RecoveryReport, Result, ServerView, SettingsUpdate,
};
use super::validate::{validate_new_server, validate_update};
use crate::engine::{ContainerEngine, ContainerRef, ContainerStatus, EngineError};
use crate::logs::{DEFAULT_LOG_BUFFER, LogRelay, LogSubscription};
use crate::ports::{PortAllocator, PortSet};
use crate::storage::{ConfigStore, Database, DatabaseError, ServerRecord, ServerStatus};

const LAUNCH_INTERRUPTED: &str = "launch interrupted";
/// Ids tried before giving up on finding an unused one.
const ID_ATTEMPTS: usize = 100;

/// Tunables of the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Image every server container is created from.
    pub image: String,
    pub base_port: u16,
    /// Time a container gets to shut down cleanly on stop/restart.
    pub grace_period: Duration,
    /// Bound on each inspect during a listing, and on the health ping.
    pub stats_timeout: Duration,
    pub log_buffer: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        let lifecycle = &config.lifecycle;
        Self {
            image: config.engine.image.clone(),
            base_port: lifecycle.base_port,
            grace_period: Duration::from_secs(lifecycle.grace_period_secs),
            stats_timeout: Duration::from_millis(lifecycle.stats_timeout_ms),
            log_buffer: if lifecycle.log_buffer == 0 {
                DEFAULT_LOG_BUFFER
            } else {
                lifecycle.log_buffer
            },
        }
    }
}

enum Recovered {
    Adopted,
    Failed,
    Skipped,
}

struct Inner {
    store: ConfigStore,
    ports: PortAllocator,
    engine: Arc<dyn ContainerEngine>,
    locks: ServerLocks,
    ids: IdGenerator,
    relay: LogRelay,
    launches: TaskTracker,
    options: ManagerOptions,
}

/// Orchestrates server lifecycles. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    /// Build a manager over `db`, keeping per-server data under `data_dir`.
    pub fn new(
        db: Database,
        data_dir: &Path,
        engine: Arc<dyn ContainerEngine>,
        options: ManagerOptions,
    ) -> Self {
        let inner = Inner {
            store: ConfigStore::new(db.clone(), data_dir),
            ports: PortAllocator::new(db, options.base_port),
            engine,
            locks: ServerLocks::new(data_dir.join("locks")),
            ids: IdGenerator::new(),
            relay: LogRelay::new(options.log_buffer),
            launches: TaskTracker::new(),
            options,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Host directory bound into the server's container.
    pub fn data_dir(&self, id: &str) -> std::path::PathBuf {
        self.inner.store.data_dir(id)
    }

    /// Persisted `server_id -> port` pairs.
    pub async fn port_mappings(&self) -> Result<Vec<(String, u16)>> {
        Ok(self.inner.ports.mappings().await?)
    }

    /// Validate, allocate a port, persist an `installing` record and start
    /// the launch in the background.
    ///
    /// Returns before the image pull. Launch failures land in the record
    /// (`error` + `last_error`), never here.
    pub async fn create_server(&self, req: NewServer) -> Result<CreatedServer> {
        validate_new_server(&req)?;
        let inner = &self.inner;

        let id = inner.fresh_id().await?;
        let guard = inner.locks.lock(&id).await?;
        let port = match inner.ports.allocate(&id).await {
            Ok(port) => port,
            Err(e) => {
                drop(guard);
                inner.locks.remove(&id);
                return Err(e.into());
            }
        };

        let record = match inner.persist_new(&id, port, &req).await {
            Ok(record) => record,
            Err(e) => {
                error!(server_id = %id, error = %e, "Failed to persist new server");
                inner.release_port_quietly(&id).await;
                if let Err(e) = inner.store.purge_data_dir(&id).await {
                    warn!(server_id = %id, error = %e, "Failed to remove server data");
                }
                drop(guard);
                inner.locks.remove(&id);
                return Err(e);
            }
        };

        info!(server_id = %id, port, name = %record.settings.name, "Server created");
        self.spawn_launch(id.clone(), guard);
        Ok(CreatedServer {
            id,
            status: record.status,
            port,
        })
    }

    /// Every readable server merged with its live container state.
    ///
    /// Inspects run concurrently, each bounded by the stats timeout; a slow
    /// or unreachable engine degrades entries to `unknown` instead of
    /// failing the listing.
    pub async fn list_servers(&self) -> Result<Vec<ServerView>> {
        let records = self.inner.store.list_all().await?;
        let count = records.len();

        let mut tasks = JoinSet::new();
        for (index, record) in records.into_iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            tasks.spawn(async move { (index, inner.view_of(record).await) });
        }

        let mut views: Vec<Option<ServerView>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, view)) => {
                    if let Some(slot) = views.get_mut(index) {
                        *slot = Some(view);
                    }
                }
                Err(e) => warn!(error = %e, "Server view task failed"),
            }
        }
        Ok(views.into_iter().flatten().collect())
    }

    pub async fn get_server(&self, id: &str) -> Result<ServerView> {
        let record = self.inner.require(id).await?;
        Ok(self.inner.view_of(record).await)
    }

    /// Start the server's container.
    ///
    /// A server in `error` without a container (its launch failed) is
    /// launched again instead.
    pub async fn start_server(&self, id: &str) -> Result<ActionOutcome> {
        let inner = &self.inner;
        let guard = inner.locks.lock(id).await?;
        let mut record = inner.require(id).await?;

        let Some(container) = record.container_ref.clone() else {
            if record.status != ServerStatus::Error {
                return Err(LifecycleError::NoContainer(id.to_string()));
            }
            info!(server_id = id, "Relaunching server after failed launch");
            record.status = ServerStatus::Installing;
            record.last_error = None;
            inner.persist(&mut record).await?;
            self.spawn_launch(id.to_string(), guard);
            return Ok(ActionOutcome::new(ActionStatus::Installing, id));
        };

        let inspected = inner.engine.inspect(&container).await;
        let snapshot = inner.checked(&mut record, inspected).await?;
        if is_up(snapshot.status) {
            inner.settle(&mut record, ServerStatus::Running).await?;
            return Ok(ActionOutcome::new(ActionStatus::AlreadyRunning, id));
        }

        let started = inner.engine.start(&container).await;
        inner.checked(&mut record, started).await?;
        record.status = ServerStatus::Running;
        record.last_error = None;
        inner.persist(&mut record).await?;
        info!(server_id = id, container = %container.short(), "Server started");
        Ok(ActionOutcome::new(ActionStatus::Started, id))
    }

    /// Stop the server's container with the grace period.
    ///
    /// Stopping a stopped server, or one with no container, is a no-op.
    pub async fn stop_server(&self, id: &str) -> Result<ActionOutcome> {
        let inner = &self.inner;
        let _guard = inner.locks.lock(id).await?;
        let mut record = inner.require(id).await?;

        let Some(container) = record.container_ref.clone() else {
            return Ok(ActionOutcome::new(ActionStatus::AlreadyStopped, id));
        };

        let inspected = inner.engine.inspect(&container).await;
        let snapshot = inner.checked(&mut record, inspected).await?;
        if !is_up(snapshot.status) {
            inner.settle(&mut record, ServerStatus::Stopped).await?;
            return Ok(ActionOutcome::new(ActionStatus::AlreadyStopped, id));
        }

        let stopped = inner
            .engine
            .stop(&container, inner.options.grace_period)
            .await;
        inner.checked(&mut record, stopped).await?;
        record.status = ServerStatus::Stopped;
        inner.persist(&mut record).await?;
        info!(server_id = id, container = %container.short(), "Server stopped");
        Ok(ActionOutcome::new(ActionStatus::Stopped, id))
    }

    pub async fn restart_server(&self, id: &str) -> Result<ActionOutcome> {
        let inner = &self.inner;
        let _guard = inner.locks.lock(id).await?;
        let mut record = inner.require(id).await?;

        let container = record
            .container_ref
            .clone()
            .ok_or_else(|| LifecycleError::NoContainer(id.to_string()))?;

        let restarted = inner
            .engine
            .restart(&container, inner.options.grace_period)
            .await;
        inner.checked(&mut record, restarted).await?;
        record.status = ServerStatus::Running;
        record.last_error = None;
        inner.persist(&mut record).await?;
        info!(server_id = id, container = %container.short(), "Server restarted");
        Ok(ActionOutcome::new(ActionStatus::Restarting, id))
    }

    /// Tear the server down: stop, remove container and volumes, remove
    /// data, delete the record, release the port.
    ///
    /// Engine and filesystem failures are logged and do not stop later
    /// steps. If the record cannot be deleted the port is kept, so the
    /// allocator never frees a port whose record still exists.
    pub async fn delete_server(&self, id: &str) -> Result<ActionOutcome> {
        let inner = &self.inner;
        let guard = inner.locks.lock(id).await?;

        let container = match inner.store.load(id).await {
            Ok(Some(record)) => record.container_ref,
            Ok(None) => return Err(LifecycleError::NotFound(id.to_string())),
            Err(DatabaseError::Corrupt { reason, .. }) => {
                warn!(server_id = id, %reason, "Deleting unreadable server record");
                // Containers are named after the server id.
                Some(ContainerRef::new(id))
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(container) = &container {
            inner.teardown_container(id, container).await;
        }
        if let Err(e) = inner.store.purge_data_dir(id).await {
            warn!(server_id = id, error = %e, "Failed to remove server data");
        }

        inner.store.delete(id).await?;
        inner.release_port_quietly(id).await;

        drop(guard);
        inner.locks.remove(id);
        info!(server_id = id, "Server deleted");
        Ok(ActionOutcome::new(ActionStatus::Deleted, id))
    }

    /// Merge the provided fields into the stored record.
    ///
    /// The running container keeps its old settings until it is created
    /// again.
    pub async fn update_settings(&self, id: &str, update: SettingsUpdate) -> Result<ActionOutcome> {
        validate_update(&update)?;
        let inner = &self.inner;
        let _guard = inner.locks.lock(id).await?;
        let mut record = inner.require(id).await?;

        debug!(server_id = id, ?update, "Updating settings");
        update.apply(&mut record);
        inner.persist(&mut record).await?;
        info!(server_id = id, "Settings updated");
        Ok(ActionOutcome::new(ActionStatus::Updated, id))
    }

    /// Follow the server's container logs.
    pub async fn stream_logs(&self, id: &str) -> Result<LogSubscription> {
        let record = self.inner.require(id).await?;
        let container = record
            .container_ref
            .ok_or_else(|| LifecycleError::NoContainer(id.to_string()))?;
        Ok(self
            .inner
            .relay
            .attach(&self.inner.engine, &container)
            .await?)
    }

    pub async fn health(&self) -> HealthReport {
        let inner = &self.inner;
        let engine_reachable =
            match tokio::time::timeout(inner.options.stats_timeout, inner.engine.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!(error = %e, "Engine ping failed");
                    false
                }
                Err(_) => {
                    debug!("Engine ping timed out");
                    false
                }
            };
        HealthReport {
            engine_reachable,
            timestamp: Utc::now(),
        }
    }

    /// Repair state left behind by a crash. Run at startup.
    ///
    /// Releases port mappings without a record, restores missing mappings
    /// of existing records, and settles `installing` records whose launch
    /// task no longer exists: a container named after the server is
    /// adopted, otherwise the record is marked failed. A launch in flight
    /// in any process holds the server lock, so a record that can be
    /// locked has none.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        let live: HashSet<String> = inner.store.record_ids().await?.into_iter().collect();
        report.orphan_ports = inner.ports.release_orphans(&live).await?;

        let records = inner.store.list_all().await?;
        for record in &records {
            if inner.ports.port_of(&record.id).await?.is_none()
                && inner.ports.restore(&record.id, record.port).await?
            {
                report.restored_ports.push(record.id.clone());
            }
        }

        for record in records {
            if record.status != ServerStatus::Installing || record.container_ref.is_some() {
                continue;
            }
            let Some(_guard) = inner.locks.try_lock(&record.id) else {
                debug!(server_id = %record.id, "Launch in flight, not recovering");
                continue;
            };
            match inner.recover_install(&record.id).await {
                Ok(Recovered::Adopted) => report.adopted.push(record.id),
                Ok(Recovered::Failed) => report.failed.push(record.id),
                Ok(Recovered::Skipped) => {}
                Err(e) => warn!(server_id = %record.id, error = %e, "Failed to recover server"),
            }
        }

        if report != RecoveryReport::default() {
            info!(
                orphan_ports = report.orphan_ports.len(),
                restored_ports = report.restored_ports.len(),
                adopted = report.adopted.len(),
                failed = report.failed.len(),
                "Recovered state from previous run"
            );
        }
        Ok(report)
    }

    /// Wait until every launch task spawned so far has finished.
    pub async fn wait_for_launches(&self) {
        let launches = &self.inner.launches;
        launches.close();
        launches.wait().await;
        launches.reopen();
    }

    /// Launch tasks still running.
    pub fn pending_launches(&self) -> usize {
        self.inner.launches.len()
    }

    fn spawn_launch(&self, id: String, guard: ServerGuard) {
        let inner = Arc::clone(&self.inner);
        self.inner.launches.spawn(async move {
            inner.launch(&id).await;
            drop(guard);
        });
    }
}

const fn is_up(status: ContainerStatus) -> bool {
    matches!(status, ContainerStatus::Running | ContainerStatus::Restarting)
}

impl Inner {
    async fn require(&self, id: &str) -> Result<ServerRecord> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Write back a loaded record. A record deleted meanwhile stays deleted.
    async fn persist(&self, record: &mut ServerRecord) -> Result<()> {
        record.updated_at = Utc::now();
        if self.store.save(record).await? {
            Ok(())
        } else {
            Err(LifecycleError::NotFound(record.id.clone()))
        }
    }

    /// Persist `status` if the record does not already have it.
    async fn settle(&self, record: &mut ServerRecord, status: ServerStatus) -> Result<()> {
        if record.status != status {
            record.status = status;
            self.persist(record).await?;
        }
        Ok(())
    }

    /// Pass an engine result through, noting a failure in the record.
    async fn checked<T>(
        &self,
        record: &mut ServerRecord,
        result: std::result::Result<T, EngineError>,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(server_id = %record.id, error = %e, "Engine operation failed");
                if !e.is_unavailable() {
                    record.last_error = Some(e.to_string());
                    if let Err(db) = self.persist(record).await {
                        warn!(server_id = %record.id, error = %db, "Failed to record engine error");
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn fresh_id(&self) -> Result<String> {
        for _ in 0..ID_ATTEMPTS {
            let id = self.ids.next_id(Utc::now());
            let record_exists = match self.store.load(&id).await {
                Ok(found) => found.is_some(),
                Err(DatabaseError::Corrupt { .. }) => true,
                Err(e) => return Err(e.into()),
            };
            if record_exists || self.ports.port_of(&id).await?.is_some() {
                debug!(server_id = %id, "Server id in use, trying next");
                continue;
            }
            return Ok(id);
        }
        Err(LifecycleError::Persistence(DatabaseError::Query(
            "no unused server id available".into(),
        )))
    }

    async fn persist_new(&self, id: &str, port: u16, req: &NewServer) -> Result<ServerRecord> {
        self.store.ensure_data_dir(id).await?;
        let now = Utc::now();
        let record = ServerRecord {
            id: id.to_string(),
            settings: req.settings(),
            admin_secret: req.admin_secret.clone().unwrap_or_else(generate_secret),
            port,
            container_ref: None,
            status: ServerStatus::Installing,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&record).await?;
        Ok(record)
    }

    async fn release_port_quietly(&self, id: &str) {
        if let Err(e) = self.ports.release(id).await {
            warn!(server_id = id, error = %e, "Failed to release port");
        }
    }

    /// Pull, create and start; always ends with a terminal status persisted
    /// unless the record vanished or the store is unreachable. The outcome
    /// of a launch whose record vanished is discarded along with its
    /// container.
    async fn launch(&self, id: &str) {
        let mut record = match self.store.load(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!(server_id = id, "Server deleted before launch");
                return;
            }
            Err(e) => {
                error!(server_id = id, error = %e, "Cannot load server for launch");
                return;
            }
        };

        match self.run_container(&record).await {
            Ok(container) => {
                info!(server_id = id, container = %container.short(), "Server running");
                record.container_ref = Some(container);
                record.status = ServerStatus::Running;
                record.last_error = None;
            }
            Err(e) => {
                error!(server_id = id, error = %e, "Launch failed");
                record.fail(e.to_string());
            }
        }

        match self.persist(&mut record).await {
            Ok(()) => {}
            Err(LifecycleError::NotFound(_)) => {
                warn!(server_id = id, "Server deleted during launch, discarding outcome");
                if let Some(container) = &record.container_ref {
                    self.teardown_container(id, container).await;
                }
                if let Err(e) = self.store.purge_data_dir(id).await {
                    warn!(server_id = id, error = %e, "Failed to remove server data");
                }
            }
            Err(e) => error!(server_id = id, error = %e, "Failed to record launch outcome"),
        }
    }

    async fn run_container(&self, record: &ServerRecord) -> Result<ContainerRef> {
        let data_dir = self.store.ensure_data_dir(&record.id).await?;
        self.engine.pull(&self.options.image).await?;
        let spec = palworld_spec(
            record,
            &self.options.image,
            &data_dir,
            self.options.grace_period,
        );
        Ok(self.engine.create_and_start(&spec).await?)
    }

    async fn observe(&self, container: Option<&ContainerRef>) -> Observation {
        let Some(container) = container else {
            return Observation::NoContainer;
        };
        match tokio::time::timeout(self.options.stats_timeout, self.engine.inspect(container)).await
        {
            Ok(Ok(snapshot)) => Observation::Live(snapshot),
            Ok(Err(e)) => {
                debug!(container = %container.short(), error = %e, "Inspect failed");
                Observation::Failed(e)
            }
            Err(_) => {
                warn!(container = %container.short(), "Inspect timed out");
                Observation::TimedOut
            }
        }
    }

    async fn view_of(&self, record: ServerRecord) -> ServerView {
        let observed = self.observe(record.container_ref.as_ref()).await;
        let merged = reconcile(record.status, &observed);

        let last_error = if let Some(status) = merged.correction {
            self.correct_status(&record, status).await;
            if status == ServerStatus::Error {
                Some(CONTAINER_MISSING.to_string())
            } else {
                record.last_error.clone()
            }
        } else {
            record.last_error.clone()
        };

        ServerView {
            ports: PortSet::from_base(record.port),
            id: record.id,
            name: record.settings.name,
            status: merged.status,
            port: record.port,
            max_players: record.settings.max_players,
            description: record.settings.description,
            exp_rate: record.settings.exp_rate,
            capture_rate: record.settings.capture_rate,
            spawn_rate: record.settings.spawn_rate,
            created_at: record.created_at,
            cpu_percent: merged.usage.cpu_percent,
            memory_mb: merged.usage.memory_mb,
            last_error,
        }
    }

    /// Write an observed status back, unless a mutation on the server is in
    /// progress. Reads never wait behind writers.
    async fn correct_status(&self, seen: &ServerRecord, status: ServerStatus) {
        let Some(_guard) = self.locks.try_lock(&seen.id) else {
            debug!(server_id = %seen.id, "Server busy, not persisting observed status");
            return;
        };
        let mut current = match self.store.load(&seen.id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(server_id = %seen.id, error = %e, "Cannot reload server for status update");
                return;
            }
        };
        if current.container_ref != seen.container_ref || current.status == status {
            return;
        }

        debug!(server_id = %seen.id, from = %current.status, to = %status, "Persisting observed status");
        current.status = status;
        if status == ServerStatus::Error {
            current.last_error = Some(CONTAINER_MISSING.to_string());
        }
        if let Err(e) = self.persist(&mut current).await {
            warn!(server_id = %seen.id, error = %e, "Failed to persist observed status");
        }
    }

    async fn teardown_container(&self, id: &str, container: &ContainerRef) {
        match self.engine.inspect(container).await {
            Ok(snapshot) if is_up(snapshot.status) => {
                if let Err(e) = self.engine.stop(container, self.options.grace_period).await {
                    warn!(server_id = id, error = %e, "Failed to stop container");
                }
            }
            Ok(_) => {}
            Err(EngineError::NotFound(_)) => {
                debug!(server_id = id, "Container already gone");
                return;
            }
            Err(e) => warn!(server_id = id, error = %e, "Failed to inspect container"),
        }

        match self.engine.remove(container, true).await {
            Ok(()) => info!(server_id = id, container = %container.short(), "Container removed"),
            Err(EngineError::NotFound(_)) => debug!(server_id = id, "Container already gone"),
            Err(e) => warn!(server_id = id, error = %e, "Failed to remove container"),
        }
    }

    async fn recover_install(&self, id: &str) -> Result<Recovered> {
        let Some(mut record) = self.store.load(id).await? else {
            return Ok(Recovered::Skipped);
        };
        if record.status != ServerStatus::Installing || record.container_ref.is_some() {
            return Ok(Recovered::Skipped);
        }

        let by_name = ContainerRef::new(id);
        let outcome = match self.engine.inspect(&by_name).await {
            Ok(snapshot) => {
                record.status = if is_up(snapshot.status) {
                    ServerStatus::Running
                } else {
                    ServerStatus::Stopped
                };
                record.container_ref = Some(by_name);
                record.last_error = None;
                info!(server_id = id, status = %record.status, "Adopted container of interrupted launch");
                Recovered::Adopted
            }
            Err(EngineError::NotFound(_)) => {
                warn!(server_id = id, "Launch was interrupted, marking server failed");
                record.fail(LAUNCH_INTERRUPTED);
                Recovered::Failed
            }
            Err(e) => {
                warn!(server_id = id, error = %e, "Cannot check interrupted launch, leaving it");
                return Ok(Recovered::Skipped);
            }
        };

        self.persist(&mut record).await?;
        Ok(outcome)
    }
}
