//! # Driftwave Update
//!
//! Update negotiation and controller handoff for the Driftwave app shell.
//!
//! ## Features
//!
//! - **Update coordinator**: one state object spanning version detection,
//!   user consent, and the controller handoff
//! - **Page controller**: registration wiring, manual and periodic update
//!   checks, accept/defer actions
//! - **Declarative UI**: the coordinator publishes `UiState`; a separate
//!   presentation layer renders it
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost ── WorkerEvent ──→ PageController
//!                                   ├── UpdateCoordinator (state machine)
//!                                   │       ├── watch<UiState>
//!                                   │       └── mpsc<UpdateEvent>
//!                                   └── accept() / defer() / check_for_updates()
//! ```
//!
//! The embedding application consumes the `UiState` watch channel to render
//! the prompt and indicator, listens for [`UpdateEvent::ReloadRequested`] to
//! reload the document, and calls the controller's accept/defer/check
//! operations from its own UI.

pub mod controller;
pub mod coordinator;
pub mod ui;

pub use controller::{PageController, UpdateError};
pub use coordinator::{UpdateCoordinator, UpdateEvent, UpdatePhase};
pub use ui::UiState;
