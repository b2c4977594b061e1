//! Page-side wiring of the update negotiation.
//!
//! The controller registers the worker, adopts an already-active worker as
//! the page's controller, relays version queries, and exposes the
//! accept/defer/check operations that an embedding application calls from
//! its own UI. Everything it renders goes through the coordinator's
//! published [`UiState`](crate::ui::UiState).

use crate::coordinator::{UpdateCoordinator, UpdateEvent, UpdatePhase};
use crate::ui::UiState;
use driftwave_core::{ShellConfig, VersionTag};
use driftwave_worker::{WorkerError, WorkerEvent, WorkerHandle, WorkerHost, WorkerState};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

/// Errors surfaced by the page controller.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// The foreground half of the update machinery.
#[derive(Clone)]
pub struct PageController {
    config: ShellConfig,
    host: WorkerHost,
    coordinator: Arc<Mutex<UpdateCoordinator>>,
}

impl PageController {
    /// Create a controller plus the UI and event streams the embedding
    /// application consumes.
    pub fn new(
        config: ShellConfig,
        host: WorkerHost,
    ) -> (
        Self,
        watch::Receiver<UiState>,
        mpsc::UnboundedReceiver<UpdateEvent>,
    ) {
        let (coordinator, ui_rx, event_rx) = UpdateCoordinator::new();
        (
            Self {
                config,
                host,
                coordinator: Arc::new(Mutex::new(coordinator)),
            },
            ui_rx,
            event_rx,
        )
    }

    /// Register the worker and start the page-side loops.
    ///
    /// Fails only when nothing could be installed at all; an update install
    /// failing while an older worker is active leaves the page running on
    /// the old version.
    pub async fn start(
        &self,
        worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> Result<(), UpdateError> {
        // A page loaded under an already-active worker is controlled from
        // the start; the first-ever install never controls this page.
        if self.host.adopt_controller().await.is_some() {
            let version = self.query_version(self.host.active().await).await;
            self.coordinator.lock().await.set_current_version(version);
        }

        if let Err(e) = self.host.register().await {
            if self.host.active().await.is_none() {
                return Err(UpdateError::Registration(e.to_string()));
            }
            warn!(error = %e, "Update install failed during registration");
        }

        // An install begun before this page loaded is still in flight.
        if self.host.is_installing().await {
            self.coordinator.lock().await.install_started();
        }

        // A candidate may already be waiting from before this page loaded.
        if self.host.waiting().await.is_some() {
            let had_controller = self.host.controller().await.is_some();
            self.coordinator.lock().await.candidate_installed(had_controller);
            if had_controller {
                self.run_version_check().await;
            }
        }

        self.spawn_event_loop(worker_events);
        self.spawn_periodic_checks();
        Ok(())
    }

    /// Re-fetch the deployment now. Returns whether a new install began.
    pub async fn check_for_updates(&self) -> Result<bool, UpdateError> {
        let started = self.host.update().await?;

        if !started {
            // An already-waiting candidate may still deserve a prompt,
            // e.g. after the user deferred it earlier.
            let phase = self.coordinator.lock().await.phase();
            if matches!(phase, UpdatePhase::Waiting | UpdatePhase::Deferred)
                && self.host.waiting().await.is_some()
            {
                self.run_version_check().await;
            }
        }
        Ok(started)
    }

    /// The user accepted the update prompt.
    pub async fn accept(&self) {
        let epoch = self.coordinator.lock().await.accept();
        let Some(epoch) = epoch else {
            return;
        };

        match self.host.waiting().await {
            Some(waiting) => {
                if let Err(e) = waiting.skip_waiting(self.config.origin.clone()) {
                    warn!(error = %e, "Skip-waiting could not be delivered");
                }
            }
            None => warn!("Accepted with no waiting worker; the stall timer will re-arm the prompt"),
        }

        // The timer self-cancels via the epoch once the handoff lands.
        let controller = self.clone();
        let stall = self.config.handoff_stall_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(stall).await;
            controller.coordinator.lock().await.stall_check(epoch);
        });
    }

    /// The user dismissed the update prompt.
    pub async fn defer(&self) {
        self.coordinator.lock().await.defer();
    }

    async fn run_version_check(&self) {
        let version = self.query_version(self.host.waiting().await).await;
        self.coordinator.lock().await.version_checked(version);
    }

    async fn query_version(&self, handle: Option<WorkerHandle>) -> Option<VersionTag> {
        let handle = handle?;
        match handle
            .check_version(self.config.origin.clone(), self.config.version_query_timeout)
            .await
        {
            Ok(info) => Some(info.version),
            Err(e) => {
                debug!(error = %e, "Version query failed, treating version as unknown");
                None
            }
        }
    }

    fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        let controller = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                controller.handle_worker_event(event).await;
            }
            debug!("Worker event stream closed");
        });
    }

    async fn handle_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::UpdateFound => {
                self.coordinator.lock().await.install_started();
            }
            WorkerEvent::StateChange {
                state: WorkerState::Installed,
                ..
            } => {
                let had_controller = self.host.controller().await.is_some();
                self.coordinator.lock().await.candidate_installed(had_controller);
                if had_controller {
                    self.run_version_check().await;
                }
            }
            WorkerEvent::StateChange {
                state: WorkerState::Redundant,
                ..
            } => {
                self.coordinator.lock().await.install_failed();
            }
            WorkerEvent::ControllerChange { .. } => {
                self.coordinator.lock().await.controller_changed();
            }
            WorkerEvent::StateChange { .. } => {}
        }
    }

    fn spawn_periodic_checks(&self) {
        let controller = self.clone();
        let interval = self.config.update_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match controller.check_for_updates().await {
                    Ok(_) => debug!("Checked for updates"),
                    Err(e) => warn!(error = %e, "Periodic update check failed"),
                }
            }
        });
    }
}
