//! Application lifecycle
//!
//! `App` is the host's public handle: a staged bootstrap/teardown state
//! machine plus the loaders that wire registered models and services into
//! the process. Handles are cheap clones sharing one inner state. The two
//! lifecycle operations are serialized by an internal mutex, so an
//! interrupt arriving mid-bootstrap tears down only after bootstrap
//! finishes its current stage sequence.
//!
//! Bootstrap stage order: configuration, logging and build banner,
//! database pool (gated on `[database]`), embedder dependency hooks,
//! models, services, interrupt watcher, data patches, mode dispatch.
//! Teardown reverses it: scheduler, realtime disconnect + HTTP server,
//! database pool, dependency hooks, registries, watcher.

use crate::error::{Error, Result};
use crate::migrate;
use crate::modes;
use crate::modes::cron::Scheduler;
use crate::modes::web::ServerHandle;
use crate::registry::{ModuleRegistry, ModuleStructure, Service, ServiceSlot};
use gantry_common::config::{Config, ConfigOverrides, Mode};
use gantry_common::db::{open_pool, Collection};
use gantry_common::logging;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sqlx::SqlitePool;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Lifecycle states
///
/// `Stopped` is re-enterable: a destroyed App accepts another `init()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Created,
    Launching,
    Active,
    Stopped,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppStatus::Created => "created",
            AppStatus::Launching => "launching",
            AppStatus::Active => "active",
            AppStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Extension points around resource bring-up and teardown
///
/// `init_dependencies` runs after the database pool opens and before any
/// model loads; `destroy_dependencies` runs during teardown after the pool
/// closes. Both default to doing nothing.
#[async_trait::async_trait]
pub trait HostHooks: Send + Sync {
    async fn init_dependencies(&self, _app: &App) -> Result<()> {
        Ok(())
    }

    async fn destroy_dependencies(&self, _app: &App) -> Result<()> {
        Ok(())
    }
}

struct NoHooks;

#[async_trait::async_trait]
impl HostHooks for NoHooks {}

/// Handle on a hosted application
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    name: String,
    seed_config: Option<Config>,
    overrides: ConfigOverrides,
    hooks: Arc<dyn HostHooks>,
    registry: ModuleRegistry,
    // Serializes init() and destroy(); never held by anything else
    lifecycle: Mutex<()>,
    status_tx: watch::Sender<AppStatus>,
    status_rx: watch::Receiver<AppStatus>,
    state: RwLock<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    config: Arc<Config>,
    db: Option<SqlitePool>,
    models: Vec<(String, Arc<dyn Any + Send + Sync>)>,
    services: Vec<(String, ServiceSlot)>,
    server: Option<ServerHandle>,
    scheduler: Option<Scheduler>,
    signal_task: Option<JoinHandle<()>>,
}

/// Assembles an `App` before its first `init()`
pub struct AppBuilder {
    name: String,
    config: Option<Config>,
    overrides: ConfigOverrides,
    hooks: Arc<dyn HostHooks>,
    registry: Option<ModuleRegistry>,
}

impl AppBuilder {
    fn new() -> Self {
        AppBuilder {
            name: env!("CARGO_PKG_NAME").to_string(),
            config: None,
            overrides: ConfigOverrides::default(),
            hooks: Arc::new(NoHooks),
            registry: None,
        }
    }

    /// Application name used in logs and the health surface
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Use this configuration verbatim, skipping the cascade
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Command-line values applied on top of the cascade
    pub fn overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Install dependency hooks
    pub fn hooks(mut self, hooks: impl HostHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Attach the module registry
    pub fn registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> App {
        let (status_tx, status_rx) = watch::channel(AppStatus::Created);
        App {
            inner: Arc::new(AppInner {
                name: self.name,
                seed_config: self.config,
                overrides: self.overrides,
                hooks: self.hooks,
                registry: self.registry.unwrap_or_default(),
                lifecycle: Mutex::new(()),
                status_tx,
                status_rx,
                state: RwLock::new(RuntimeState::default()),
            }),
        }
    }
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> AppStatus {
        *self.inner.status_rx.borrow()
    }

    /// Subscribe to status transitions
    pub fn status_watch(&self) -> watch::Receiver<AppStatus> {
        self.inner.status_rx.clone()
    }

    /// Current configuration; defaults before the first `init()`
    pub fn config(&self) -> Arc<Config> {
        self.state().config.clone()
    }

    /// The database pool, when `[database]` is configured and the host is
    /// initialized
    pub fn db(&self) -> Result<SqlitePool> {
        self.state()
            .db
            .clone()
            .ok_or_else(|| Error::InvalidState("no database configured".to_string()))
    }

    /// Open a named document collection on the host database
    pub async fn collection(&self, name: &str) -> Result<Collection> {
        let db = self.db()?;
        Ok(Collection::open(&db, name).await?)
    }

    /// The fixed module structure computed at registry build time
    pub fn structure(&self) -> Arc<ModuleStructure> {
        self.inner.registry.structure()
    }

    /// Typed handle to a loaded model
    pub fn model<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let handle = self
            .state()
            .models
            .iter()
            .find(|(model, _)| model == name)
            .map(|(_, handle)| handle.clone())
            .ok_or_else(|| Error::Model(format!("model '{}' is not loaded", name)))?;

        handle.downcast::<T>().map_err(|_| {
            Error::Model(format!(
                "model '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Typed handle to an initialized service
    pub fn service<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let handle = self
            .state()
            .services
            .iter()
            .find(|(service, _)| service == name)
            .map(|(_, slot)| slot.any.clone())
            .ok_or_else(|| Error::Service(format!("service '{}' is not loaded", name)))?;

        handle.downcast::<T>().map_err(|_| {
            Error::Service(format!(
                "service '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Bound address of the web-mode server
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().server.as_ref().map(|s| s.local_addr())
    }

    /// Open realtime bridge connections
    pub fn realtime_connections(&self) -> usize {
        self.state()
            .server
            .as_ref()
            .map(|s| s.realtime_connections())
            .unwrap_or(0)
    }

    /// Start a manual scheduler task by name (cron mode)
    pub fn start_task(&self, name: &str) -> Result<()> {
        let app = self.clone();
        match &mut self.state_mut().scheduler {
            Some(scheduler) => scheduler.start(&app, name),
            None => Err(Error::InvalidState("no scheduler is running".to_string())),
        }
    }

    /// Bring the application up through every bootstrap stage
    ///
    /// Calling `init()` while launching or active logs an error and returns
    /// `Ok(())` without doing anything. Errors before mode dispatch abort
    /// bootstrap and leave the status at `launching`; a data patch failure
    /// tears the host down first and surfaces as `Error::Migration`.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        match self.status() {
            AppStatus::Created | AppStatus::Stopped => {}
            status => {
                error!("init() called while {}; ignoring", status);
                return Ok(());
            }
        }
        self.set_status(AppStatus::Launching);
        self.init_inner().await
    }

    async fn init_inner(&self) -> Result<()> {
        let config = match &self.inner.seed_config {
            Some(seed) => Arc::new(seed.clone()),
            None => Arc::new(Config::load(&self.inner.overrides).await?),
        };
        self.state_mut().config = config.clone();

        logging::init(&config.log.level);
        info!("{} starting...", self.inner.name);
        info!(
            "Version: {} | Build: {} ({}) | Built: {}",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_HASH"),
            env!("BUILD_PROFILE"),
            env!("BUILD_TIMESTAMP")
        );

        if let Some(db_config) = &config.database {
            let pool = open_pool(db_config).await?;
            self.state_mut().db = Some(pool);
        }

        self.inner.hooks.init_dependencies(self).await?;

        self.load_models().await?;
        self.load_services().await?;

        self.spawn_signal_watcher();

        // A failing patch has already torn the host down when this errors
        migrate::run(self).await?;

        match config.mode {
            Mode::Internal => {}
            Mode::Cron => modes::cron::start(self)?,
            Mode::Web => modes::web::start(self).await?,
        }

        self.set_status(AppStatus::Active);
        info!(
            "{} active (mode: {}, environment: {})",
            self.inner.name, config.mode, config.environment
        );
        Ok(())
    }

    /// Tear the application down
    ///
    /// Idempotent: a no-op while `created` or `stopped`. Step failures are
    /// logged and teardown continues; the first error is returned once
    /// everything has been attempted. The status becomes `stopped` last.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.destroy_inner().await
    }

    pub(crate) async fn destroy_inner(&self) -> Result<()> {
        match self.status() {
            AppStatus::Created | AppStatus::Stopped => {
                debug!("destroy() called while {}; nothing to do", self.status());
                return Ok(());
            }
            _ => {}
        }

        info!("{} shutting down...", self.inner.name);
        let mut first_error: Option<Error> = None;

        let scheduler = self.state_mut().scheduler.take();
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown().await;
            info!("✓ Scheduler stopped");
        }

        let server = self.state_mut().server.take();
        if let Some(server) = server {
            if let Err(e) = server.shutdown().await {
                error!("HTTP server teardown failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let db = self.state_mut().db.take();
        if let Some(pool) = db {
            pool.close().await;
            info!("✓ Database pool closed");
        }

        if let Err(e) = self.inner.hooks.destroy_dependencies(self).await {
            error!("Dependency teardown failed: {}", e);
            first_error.get_or_insert(e);
        }

        {
            let mut state = self.state_mut();
            state.models.clear();
            state.services.clear();
            if let Some(task) = state.signal_task.take() {
                task.abort();
            }
        }

        info!("{} stopped", self.inner.name);
        self.set_status(AppStatus::Stopped);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Park until the status reaches `stopped`
    pub async fn wait_until_stopped(&self) {
        let mut watch = self.inner.status_rx.clone();
        let _ = watch.wait_for(|status| *status == AppStatus::Stopped).await;
    }

    async fn load_models(&self) -> Result<()> {
        let total = self.inner.registry.models.len();
        for (name, hook) in &self.inner.registry.models {
            debug!("Loading model '{}'", name);
            let handle = hook(self.clone())
                .await
                .map_err(|e| Error::Model(format!("'{}' failed to initialize: {}", name, e)))?;
            self.state_mut().models.push((name.clone(), handle));
        }
        if total > 0 {
            info!("✓ {} models loaded", total);
        }
        Ok(())
    }

    async fn load_services(&self) -> Result<()> {
        // Construct every service first; init hooks may look earlier
        // services up by name
        for (name, def) in &self.inner.registry.modules {
            if let Some(ctor) = &def.service {
                let slot = ctor();
                self.state_mut().services.push((name.clone(), slot));
            }
        }

        let services: Vec<(String, Arc<dyn Service>)> = self
            .state()
            .services
            .iter()
            .map(|(name, slot)| (name.clone(), slot.service.clone()))
            .collect();

        let total = services.len();
        for (name, service) in services {
            debug!("Initializing service '{}'", name);
            service
                .init(self)
                .await
                .map_err(|e| Error::Service(format!("'{}' failed to initialize: {}", name, e)))?;
        }
        if total > 0 {
            info!("✓ {} services initialized", total);
        }
        Ok(())
    }

    fn spawn_signal_watcher(&self) {
        let app = self.clone();
        let task = tokio::spawn(async move {
            interrupt_signal().await;
            // Detach first so destroy() does not abort the task running it
            app.state_mut().signal_task.take();
            let code = match app.destroy().await {
                Ok(()) => 0,
                Err(e) => {
                    error!("Teardown failed: {}", e);
                    1
                }
            };
            std::process::exit(code);
        });
        self.state_mut().signal_task = Some(task);
    }

    fn set_status(&self, status: AppStatus) {
        debug!("{} status -> {}", self.inner.name, status);
        let _ = self.inner.status_tx.send(status);
    }

    pub(crate) fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    pub(crate) fn set_server(&self, server: ServerHandle) {
        self.state_mut().server = Some(server);
    }

    pub(crate) fn set_scheduler(&self, scheduler: Scheduler) {
        self.state_mut().scheduler = Some(scheduler);
    }

    fn state(&self) -> RwLockReadGuard<'_, RuntimeState> {
        self.inner.state.read()
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, RuntimeState> {
        self.inner.state.write()
    }
}

/// Resolves when the process receives SIGINT or SIGTERM
async fn interrupt_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
