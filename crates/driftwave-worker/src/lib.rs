//! # Driftwave Worker
//!
//! Background worker lifecycle and messaging for the Driftwave app shell.
//!
//! ## Features
//!
//! - **Worker instances**: single-threaded command loops owning one cache
//!   generation each
//! - **Lifecycle**: parsed → installing → installed → activating →
//!   activated → redundant
//! - **Message protocol**: skip-waiting and version-check with a typed,
//!   timeout-bounded reply channel
//! - **Worker host**: registration slots, controller bookkeeping, serialized
//!   activation, install retry, lifecycle events
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost
//!     ├── installing (WorkerHandle)
//!     ├── waiting    (WorkerHandle)
//!     ├── active     (WorkerHandle)
//!     └── controller (WorkerId)
//!
//! Page ── WorkerHandle ── commands ──→ WorkerInstance task
//!                                          └── CacheManager
//! Page ←──────── WorkerEvent channel ── WorkerHost
//! ```

use driftwave_cache::{
    CacheError, CacheManager, FetchDecision, FetchRequest, NetworkBackend, SharedCacheStorage,
};
use driftwave_core::{
    retry_with_backoff, with_timeout, Generation, ResourceManifest, RetryConfig, ShellConfig,
    VersionTag,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

pub mod version;

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Worker is gone")]
    Terminated,

    #[error("Version query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state. Owned by the host; the page only observes
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, not yet installing.
    Parsed,
    /// Populating its cache generation.
    Installing,
    /// Installed; waiting if a controller already exists.
    Installed,
    /// Sweeping superseded generations.
    Activating,
    /// Active, eligible to control pages.
    Activated,
    /// Replaced or failed; will never run again.
    Redundant,
}

/// Reply payload of a version query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// The worker's build tag.
    pub version: VersionTag,
    /// The worker's cache bucket name.
    pub cache_name: String,
}

/// The deployable worker definition: what a registration "fetches".
///
/// Two blueprints are the same deployment iff version and generation both
/// match; the host only installs a candidate for a differing blueprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerBlueprint {
    /// Application build tag.
    pub version: VersionTag,
    /// Cache generation.
    pub generation: Generation,
    /// Install-time resource allow-list.
    pub manifest: ResourceManifest,
}

// ==================== Script Source ====================

/// Yields the currently-deployed blueprint, standing in for fetching the
/// worker script from the network.
pub trait ScriptSource: Send + Sync {
    /// The blueprint of the current deployment.
    fn current(&self) -> Result<WorkerBlueprint, WorkerError>;
}

/// A script source backed by a mutable slot; `set` simulates a deploy.
pub struct StaticScriptSource {
    deployed: std::sync::Mutex<WorkerBlueprint>,
}

impl StaticScriptSource {
    /// Create a source serving the given blueprint.
    pub fn new(blueprint: WorkerBlueprint) -> Self {
        Self {
            deployed: std::sync::Mutex::new(blueprint),
        }
    }

    /// Replace the deployed blueprint.
    pub fn set(&self, blueprint: WorkerBlueprint) {
        *self.deployed.lock().expect("script source poisoned") = blueprint;
    }
}

impl ScriptSource for StaticScriptSource {
    fn current(&self) -> Result<WorkerBlueprint, WorkerError> {
        Ok(self.deployed.lock().expect("script source poisoned").clone())
    }
}

// ==================== Message Protocol ====================

/// A page-to-worker message.
#[derive(Debug)]
pub enum PageMessage {
    /// Instruct a waiting worker to activate immediately. No reply.
    SkipWaiting,
    /// Request the worker's version and cache identity.
    CheckVersion {
        /// Dedicated one-shot reply channel.
        reply: oneshot::Sender<VersionInfo>,
    },
}

/// A message wrapped with its sender origin. Messages from an unexpected
/// origin are dropped.
#[derive(Debug)]
pub struct MessageEnvelope {
    /// Origin of the sending context.
    pub origin: Url,
    /// The message itself.
    pub payload: PageMessage,
}

/// Commands delivered to a worker instance's command loop.
enum WorkerCommand {
    Install {
        reply: oneshot::Sender<Result<(), WorkerError>>,
    },
    Activate {
        reply: oneshot::Sender<()>,
    },
    Fetch {
        request: FetchRequest,
        reply: oneshot::Sender<Result<FetchDecision, CacheError>>,
    },
    Message(MessageEnvelope),
}

/// Signals a worker instance raises toward its host.
enum HostSignal {
    SkipWaiting(WorkerId),
}

// ==================== Worker Handle ====================

/// Clonable page-side handle to a worker instance.
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    /// The worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Post a fire-and-forget message.
    pub fn post(&self, envelope: MessageEnvelope) -> Result<(), WorkerError> {
        self.tx
            .send(WorkerCommand::Message(envelope))
            .map_err(|_| WorkerError::Terminated)
    }

    /// Query the worker's version over a dedicated reply channel, bounded
    /// by `timeout`. A silent channel yields [`WorkerError::QueryTimeout`];
    /// the caller treats the version as unknown.
    pub async fn check_version(
        &self,
        origin: Url,
        timeout: Duration,
    ) -> Result<VersionInfo, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.post(MessageEnvelope {
            origin,
            payload: PageMessage::CheckVersion { reply },
        })?;

        match with_timeout(timeout, || rx).await {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(WorkerError::Terminated),
            Err(_) => Err(WorkerError::QueryTimeout(timeout)),
        }
    }

    /// Instruct the worker to skip waiting.
    pub fn skip_waiting(&self, origin: Url) -> Result<(), WorkerError> {
        self.post(MessageEnvelope {
            origin,
            payload: PageMessage::SkipWaiting,
        })
    }

    pub(crate) async fn install(&self) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Install { reply })
            .map_err(|_| WorkerError::Terminated)?;
        rx.await.map_err(|_| WorkerError::Terminated)?
    }

    pub(crate) async fn activate(&self) -> Result<(), WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Activate { reply })
            .map_err(|_| WorkerError::Terminated)?;
        rx.await.map_err(|_| WorkerError::Terminated)
    }

    pub(crate) async fn dispatch_fetch(
        &self,
        request: FetchRequest,
    ) -> Result<FetchDecision, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Fetch { request, reply })
            .map_err(|_| WorkerError::Terminated)?;
        Ok(rx.await.map_err(|_| WorkerError::Terminated)??)
    }
}

// ==================== Worker Instance ====================

/// One background worker: a command loop owning one cache generation.
/// Commands are processed strictly in arrival order; there is no shared
/// state with the page beyond the cache storage handle.
struct WorkerInstance {
    id: WorkerId,
    blueprint: WorkerBlueprint,
    origin: Url,
    cache: CacheManager,
    host_tx: mpsc::UnboundedSender<HostSignal>,
}

impl WorkerInstance {
    fn spawn(
        blueprint: WorkerBlueprint,
        origin: Url,
        cache: CacheManager,
        host_tx: mpsc::UnboundedSender<HostSignal>,
    ) -> WorkerHandle {
        let id = WorkerId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let instance = Self {
            id,
            blueprint,
            origin,
            cache,
            host_tx,
        };

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                instance.handle_command(command).await;
            }
            trace!(worker = ?instance.id, "Worker command loop ended");
        });

        WorkerHandle { id, tx }
    }

    async fn handle_command(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::Install { reply } => {
                let result = self
                    .cache
                    .install()
                    .await
                    .map_err(|e| WorkerError::InstallFailed(e.to_string()));
                let _ = reply.send(result);
            }
            WorkerCommand::Activate { reply } => {
                self.cache.activate().await;
                let _ = reply.send(());
            }
            WorkerCommand::Fetch { request, reply } => {
                let _ = reply.send(self.cache.handle_fetch(&request).await);
            }
            WorkerCommand::Message(envelope) => self.handle_message(envelope),
        }
    }

    fn handle_message(&self, envelope: MessageEnvelope) {
        // Guard against cross-context message spoofing.
        if envelope.origin.origin() != self.origin.origin() {
            warn!(worker = ?self.id, origin = %envelope.origin, "Message ignored from unexpected origin");
            return;
        }

        match envelope.payload {
            PageMessage::SkipWaiting => {
                debug!(worker = ?self.id, "Received skip-waiting");
                let _ = self.host_tx.send(HostSignal::SkipWaiting(self.id));
            }
            PageMessage::CheckVersion { reply } => {
                let _ = reply.send(VersionInfo {
                    version: self.blueprint.version.clone(),
                    cache_name: self.cache.bucket_name().to_string(),
                });
            }
        }
    }
}

// ==================== Worker Events ====================

/// Page-observable lifecycle events.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A new candidate worker was found and is about to install.
    UpdateFound,
    /// A worker changed lifecycle state.
    StateChange { id: WorkerId, state: WorkerState },
    /// A newly activated worker took control of the page.
    ControllerChange { id: WorkerId },
}

// ==================== Worker Host ====================

/// A registered worker occupying one of the host's slots.
#[derive(Clone)]
struct RegisteredWorker {
    id: WorkerId,
    blueprint: WorkerBlueprint,
    handle: WorkerHandle,
}

#[derive(Default)]
struct HostState {
    installing: Option<RegisteredWorker>,
    waiting: Option<RegisteredWorker>,
    active: Option<RegisteredWorker>,
    controller: Option<WorkerId>,
}

/// The substrate that schedules worker instances: registration slots,
/// controller bookkeeping, serialized activation, and lifecycle events.
#[derive(Clone)]
pub struct WorkerHost {
    inner: Arc<RwLock<HostState>>,
    origin: Url,
    cache_prefix: String,
    install_retry: RetryConfig,
    storage: SharedCacheStorage,
    network: Arc<dyn NetworkBackend>,
    source: Arc<dyn ScriptSource>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    signal_tx: mpsc::UnboundedSender<HostSignal>,
}

impl WorkerHost {
    /// Create a host and the event stream pages observe.
    pub fn new(
        config: &ShellConfig,
        source: Arc<dyn ScriptSource>,
        network: Arc<dyn NetworkBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let host = Self {
            inner: Arc::new(RwLock::new(HostState::default())),
            origin: config.origin.clone(),
            cache_prefix: config.cache_prefix.clone(),
            install_retry: config.install_retry.clone(),
            storage: driftwave_cache::shared_storage(),
            network,
            source,
            event_tx,
            signal_tx,
        };

        host.spawn_signal_loop(signal_rx);
        (host, event_rx)
    }

    /// The cache storage shared by this host's worker generations.
    pub fn storage(&self) -> SharedCacheStorage {
        self.storage.clone()
    }

    /// Register the worker. The first registration installs the current
    /// deployment; later ones behave like an update check.
    pub async fn register(&self) -> Result<(), WorkerError> {
        let blueprint = self.source.current()?;
        let fresh = {
            let state = self.inner.read().await;
            state.active.is_none() && state.waiting.is_none() && state.installing.is_none()
        };

        if fresh {
            info!(version = %blueprint.version, generation = %blueprint.generation, "Registering worker");
            self.install_candidate(blueprint).await
        } else {
            self.check_deployment(blueprint).await.map(|_| ())
        }
    }

    /// Re-fetch the deployment and install it when it differs from what is
    /// already active or waiting. Returns whether an install ran.
    pub async fn update(&self) -> Result<bool, WorkerError> {
        let blueprint = self.source.current()?;
        self.check_deployment(blueprint).await
    }

    /// Adopt the active worker as this page's controller, as a page loaded
    /// under an active worker is controlled from the start. Does not emit
    /// a controller change.
    pub async fn adopt_controller(&self) -> Option<WorkerId> {
        let mut state = self.inner.write().await;
        if state.controller.is_none() {
            state.controller = state.active.as_ref().map(|w| w.id);
        }
        state.controller
    }

    /// Handle to the waiting worker, if any.
    pub async fn waiting(&self) -> Option<WorkerHandle> {
        self.inner.read().await.waiting.as_ref().map(|w| w.handle.clone())
    }

    /// Handle to the active worker, if any.
    pub async fn active(&self) -> Option<WorkerHandle> {
        self.inner.read().await.active.as_ref().map(|w| w.handle.clone())
    }

    /// Whether a candidate is currently installing.
    pub async fn is_installing(&self) -> bool {
        self.inner.read().await.installing.is_some()
    }

    /// The current controller, if any.
    pub async fn controller(&self) -> Option<WorkerId> {
        self.inner.read().await.controller
    }

    /// Route a page fetch through the controlling worker. Uncontrolled
    /// pages pass through to the network natively.
    pub async fn dispatch_fetch(&self, request: FetchRequest) -> Result<FetchDecision, WorkerError> {
        let handle = {
            let state = self.inner.read().await;
            match (state.controller, &state.active) {
                (Some(id), Some(active)) if active.id == id => Some(active.handle.clone()),
                _ => None,
            }
        };

        match handle {
            Some(handle) => handle.dispatch_fetch(request).await,
            None => Ok(FetchDecision::Passthrough),
        }
    }

    async fn check_deployment(&self, blueprint: WorkerBlueprint) -> Result<bool, WorkerError> {
        let known = {
            let state = self.inner.read().await;
            if state.installing.is_some() {
                // One install at a time; the next check sees the result.
                return Ok(false);
            }
            let same = |w: &RegisteredWorker| w.blueprint == blueprint;
            state.active.as_ref().is_some_and(same) || state.waiting.as_ref().is_some_and(same)
        };

        if known {
            return Ok(false);
        }

        info!(version = %blueprint.version, generation = %blueprint.generation, "New deployment found");
        self.install_candidate(blueprint).await?;
        Ok(true)
    }

    /// Spawn a candidate instance and drive it through install. On
    /// success the candidate parks in the waiting slot (update) or
    /// activates immediately without claiming (first install).
    async fn install_candidate(&self, blueprint: WorkerBlueprint) -> Result<(), WorkerError> {
        let cache = CacheManager::new(
            self.origin.clone(),
            &self.cache_prefix,
            blueprint.generation,
            blueprint.manifest.clone(),
            self.storage.clone(),
            self.network.clone(),
        );
        let handle = WorkerInstance::spawn(
            blueprint.clone(),
            self.origin.clone(),
            cache,
            self.signal_tx.clone(),
        );
        let reg = RegisteredWorker {
            id: handle.id(),
            blueprint,
            handle,
        };

        {
            let mut state = self.inner.write().await;
            state.installing = Some(reg.clone());
        }
        self.emit(WorkerEvent::UpdateFound);
        self.emit(WorkerEvent::StateChange {
            id: reg.id,
            state: WorkerState::Installing,
        });

        let outcome = retry_with_backoff(&self.install_retry, || reg.handle.install()).await;

        if let Err(e) = outcome {
            warn!(worker = ?reg.id, error = %e, "Install failed, discarding candidate");
            self.inner.write().await.installing = None;
            self.emit(WorkerEvent::StateChange {
                id: reg.id,
                state: WorkerState::Redundant,
            });
            return Err(e);
        }

        let (had_active, evicted) = {
            let mut state = self.inner.write().await;
            state.installing = None;
            if state.active.is_some() {
                (true, state.waiting.replace(reg.clone()))
            } else {
                (false, None)
            }
        };

        self.emit(WorkerEvent::StateChange {
            id: reg.id,
            state: WorkerState::Installed,
        });
        if let Some(old) = evicted {
            self.emit(WorkerEvent::StateChange {
                id: old.id,
                state: WorkerState::Redundant,
            });
        }

        if !had_active {
            // First install: activate, but never claim, so a fresh page is
            // not reloaded right after installing.
            self.activate_worker(reg, false).await;
        }
        Ok(())
    }

    /// Activate one worker: sweep superseded buckets, replace the active
    /// slot, and claim the page when this is an update.
    async fn activate_worker(&self, reg: RegisteredWorker, claim: bool) {
        self.emit(WorkerEvent::StateChange {
            id: reg.id,
            state: WorkerState::Activating,
        });

        if let Err(e) = reg.handle.activate().await {
            warn!(worker = ?reg.id, error = %e, "Activation sweep failed");
        }

        let replaced = {
            let mut state = self.inner.write().await;
            let replaced = state.active.replace(reg.clone());
            if claim {
                state.controller = Some(reg.id);
            }
            replaced
        };

        if let Some(old) = replaced {
            self.emit(WorkerEvent::StateChange {
                id: old.id,
                state: WorkerState::Redundant,
            });
        }
        self.emit(WorkerEvent::StateChange {
            id: reg.id,
            state: WorkerState::Activated,
        });
        if claim {
            info!(worker = ?reg.id, "Worker claimed the page");
            self.emit(WorkerEvent::ControllerChange { id: reg.id });
        }
    }

    /// Promote the waiting worker after a skip-waiting instruction.
    async fn promote_waiting(&self, id: WorkerId) {
        let (reg, had_active) = {
            let mut state = self.inner.write().await;
            let reg = match state.waiting.take() {
                Some(w) if w.id == id => w,
                Some(other) => {
                    debug!(worker = ?id, "Skip-waiting from a non-waiting worker ignored");
                    state.waiting = Some(other);
                    return;
                }
                None => {
                    debug!(worker = ?id, "Skip-waiting with no waiting worker ignored");
                    return;
                }
            };
            (reg, state.active.is_some())
        };

        // Claim only when an active worker existed before this activation:
        // that is what makes it an update rather than a first install.
        self.activate_worker(reg, had_active).await;
    }

    fn spawn_signal_loop(&self, mut signal_rx: mpsc::UnboundedReceiver<HostSignal>) {
        let host = self.clone();
        tokio::spawn(async move {
            // One signal at a time: activations never overlap.
            while let Some(signal) = signal_rx.recv().await {
                match signal {
                    HostSignal::SkipWaiting(id) => host.promote_waiting(id).await,
                }
            }
        });
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ==================== Tests ====================
