//! The update negotiation state machine.
//!
//! One state object owns every flag of the negotiation: the tracked
//! version, the update-available flag, the pending-handoff epoch, and the
//! controller-change latch. All UI output is a published [`UiState`]; all
//! page effects are events. The machine itself never touches a rendering
//! environment, which keeps every transition unit-testable.

use crate::ui::UiState;
use driftwave_core::VersionTag;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Phase of the update negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    /// No candidate in flight.
    Idle,
    /// A candidate worker is installing.
    Installing,
    /// A candidate is installed and waiting; no prompt is showing.
    Waiting,
    /// The prompt is showing.
    Notified,
    /// The user deferred; the candidate keeps waiting silently.
    Deferred,
    /// Skip-waiting was sent; awaiting the controller change.
    Applying,
    /// The handoff completed, or a first install finished.
    Activated,
}

/// Page-observable effects of the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// A meaningfully new version is waiting; the prompt is showing.
    UpdateAvailable {
        /// The candidate's build tag.
        version: VersionTag,
    },
    /// The user accepted; skip-waiting was sent.
    HandoffStarted,
    /// The handoff completed; the document should reload so every
    /// resource is re-fetched under the new controller.
    ReloadRequested,
    /// No controller change arrived within the stall bound; the prompt
    /// was re-armed.
    HandoffStalled,
    /// The user deferred the update.
    UpdateDeferred,
}

/// The update negotiation state machine.
pub struct UpdateCoordinator {
    phase: UpdatePhase,
    current_version: Option<VersionTag>,
    candidate_version: Option<VersionTag>,
    update_available: bool,
    /// Identity of the pending handoff; a stall timer only acts on the
    /// epoch it was armed for.
    handoff_epoch: u64,
    /// Latch ensuring one controller change is handled per handoff. It
    /// re-arms on the next accepted handoff, so sequential handoffs
    /// within one page lifetime work.
    handoff_inflight: bool,
    ui_tx: watch::Sender<UiState>,
    event_tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl UpdateCoordinator {
    /// Create a coordinator plus its UI and event streams.
    pub fn new() -> (
        Self,
        watch::Receiver<UiState>,
        mpsc::UnboundedReceiver<UpdateEvent>,
    ) {
        let (ui_tx, ui_rx) = watch::channel(UiState::hidden());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                phase: UpdatePhase::Idle,
                current_version: None,
                candidate_version: None,
                update_available: false,
                handoff_epoch: 0,
                handoff_inflight: false,
                ui_tx,
                event_tx,
            },
            ui_rx,
            event_rx,
        )
    }

    /// The current phase.
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Whether an update is known to be available.
    pub fn update_available(&self) -> bool {
        self.update_available
    }

    /// The version currently controlling the page, when known.
    pub fn current_version(&self) -> Option<&VersionTag> {
        self.current_version.as_ref()
    }

    /// Record the version of the already-active worker, queried at page
    /// startup.
    pub fn set_current_version(&mut self, version: Option<VersionTag>) {
        self.current_version = version;
    }

    /// A candidate worker began installing.
    pub fn install_started(&mut self) {
        debug!("Candidate install started");
        if self.phase == UpdatePhase::Idle || self.phase == UpdatePhase::Activated {
            self.phase = UpdatePhase::Installing;
        }
    }

    /// The installing candidate was discarded.
    pub fn install_failed(&mut self) {
        if self.phase == UpdatePhase::Installing {
            self.phase = UpdatePhase::Idle;
        }
    }

    /// A candidate finished installing. With no pre-existing controller
    /// this is a first install: it activates silently and no prompt is
    /// ever shown.
    pub fn candidate_installed(&mut self, had_controller: bool) {
        if had_controller {
            info!("Update candidate installed and waiting");
            self.phase = UpdatePhase::Waiting;
        } else {
            info!("Worker installed for the first time");
            self.phase = UpdatePhase::Activated;
        }
    }

    /// Outcome of the candidate version query. `None` means the query
    /// timed out: the version is unknown and the prompt stays hidden
    /// rather than risking a false positive.
    pub fn version_checked(&mut self, candidate: Option<VersionTag>) {
        if self.phase != UpdatePhase::Waiting && self.phase != UpdatePhase::Deferred {
            debug!(phase = ?self.phase, "Version check result ignored in this phase");
            return;
        }

        let Some(candidate) = candidate else {
            debug!("Candidate version unknown, suppressing notification");
            return;
        };

        if Some(&candidate) == self.current_version.as_ref() {
            // Byte-identical redeploy: nothing meaningfully new.
            debug!(version = %candidate, "Candidate version matches current, suppressing notification");
            return;
        }

        info!(version = %candidate, "New version available");
        self.candidate_version = Some(candidate.clone());
        self.update_available = true;
        self.phase = UpdatePhase::Notified;
        self.set_ui(UiState::prompt());
        self.emit(UpdateEvent::UpdateAvailable { version: candidate });
    }

    /// The user accepted the prompt. Returns the epoch to arm the stall
    /// timer with, or `None` when no prompt is showing.
    pub fn accept(&mut self) -> Option<u64> {
        if self.phase != UpdatePhase::Notified {
            debug!(phase = ?self.phase, "Accept ignored, no prompt showing");
            return None;
        }

        self.phase = UpdatePhase::Applying;
        self.handoff_epoch += 1;
        self.handoff_inflight = true;
        self.set_ui(UiState::indicator());
        self.emit(UpdateEvent::HandoffStarted);
        Some(self.handoff_epoch)
    }

    /// The user dismissed the prompt. The candidate keeps waiting and a
    /// later page load or manual check may re-notify.
    pub fn defer(&mut self) {
        if self.phase != UpdatePhase::Notified {
            return;
        }
        info!("Update deferred");
        self.phase = UpdatePhase::Deferred;
        self.update_available = false;
        self.set_ui(UiState::hidden());
        self.emit(UpdateEvent::UpdateDeferred);
    }

    /// A controller change fired. Returns whether a reload was requested.
    ///
    /// Only a change following an accepted handoff reloads; the first
    /// controller acquisition of a page's lifetime is ignored, as is any
    /// duplicate delivery for an already-completed handoff.
    pub fn controller_changed(&mut self) -> bool {
        if !self.handoff_inflight {
            debug!("Controller change without pending handoff, ignoring");
            return false;
        }

        info!("New version activated");
        self.handoff_inflight = false;
        self.update_available = false;
        self.phase = UpdatePhase::Activated;
        self.current_version = self.candidate_version.take();
        self.set_ui(UiState::hidden());
        self.emit(UpdateEvent::ReloadRequested);
        true
    }

    /// A stall timer fired for the given epoch. If that handoff is still
    /// pending, the indicator is dropped and the prompt re-armed; the
    /// user may retry.
    pub fn stall_check(&mut self, epoch: u64) {
        if self.phase != UpdatePhase::Applying || !self.handoff_inflight {
            return;
        }
        if epoch != self.handoff_epoch {
            return;
        }

        warn!("Handoff stalled, re-arming prompt");
        self.handoff_inflight = false;
        self.phase = UpdatePhase::Notified;
        self.set_ui(UiState::prompt());
        self.emit(UpdateEvent::HandoffStalled);
    }

    fn set_ui(&self, state: UiState) {
        self.ui_tx.send_replace(state);
    }

    fn emit(&self, event: UpdateEvent) {
        let _ = self.event_tx.send(event);
    }
}
