//! End-to-end update negotiation: host, worker, and page controller wired
//! together over a scripted network.

use driftwave_cache::testing::ScriptedBackend;
use driftwave_core::{Generation, ResourceManifest, RetryConfig, ShellConfig, VersionTag};
use driftwave_update::{PageController, UiState, UpdateEvent};
use driftwave_worker::{StaticScriptSource, WorkerBlueprint, WorkerEvent, WorkerHost};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn test_config() -> ShellConfig {
    let mut config = ShellConfig::default();
    config.version_query_timeout = Duration::from_millis(200);
    config.handoff_stall_timeout = Duration::from_millis(150);
    config.install_retry = RetryConfig::none();
    config
}

fn blueprint(manifest: &ResourceManifest, version: &str, generation: u64) -> WorkerBlueprint {
    WorkerBlueprint {
        version: VersionTag::new(version),
        generation: Generation(generation),
        manifest: manifest.clone(),
    }
}

struct Shell {
    config: ShellConfig,
    controller: PageController,
    source: Arc<StaticScriptSource>,
    host: WorkerHost,
    ui: watch::Receiver<UiState>,
    events: mpsc::UnboundedReceiver<UpdateEvent>,
}

impl Shell {
    fn deploy(&self, version: &str, generation: u64) {
        self.source
            .set(blueprint(&self.config.manifest, version, generation));
    }
}

/// A page visiting for the very first time: nothing installed yet.
async fn boot_first_visit() -> Shell {
    let config = test_config();
    let backend = Arc::new(ScriptedBackend::for_manifest(&config.origin, &config.manifest));
    let source = Arc::new(StaticScriptSource::new(blueprint(
        &config.manifest,
        "1.0",
        1,
    )));
    let (host, worker_events) = WorkerHost::new(&config, source.clone(), backend);

    let (controller, ui, events) = PageController::new(config.clone(), host.clone());
    controller.start(worker_events).await.unwrap();

    Shell {
        config,
        controller,
        source,
        host,
        ui,
        events,
    }
}

/// A page loading while version 1.0 is already installed and active: the
/// common "second visit" state every update scenario starts from.
async fn boot_returning_visit() -> Shell {
    let config = test_config();
    let backend = Arc::new(ScriptedBackend::for_manifest(&config.origin, &config.manifest));
    let source = Arc::new(StaticScriptSource::new(blueprint(
        &config.manifest,
        "1.0",
        1,
    )));
    let (host, mut worker_events) = WorkerHost::new(&config, source.clone(), backend);

    // The previous session installed the worker; its lifecycle events
    // belonged to that page, not this one.
    host.register().await.unwrap();
    while worker_events.try_recv().is_ok() {}

    let (controller, ui, events) = PageController::new(config.clone(), host.clone());
    controller.start(worker_events).await.unwrap();

    Shell {
        config,
        controller,
        source,
        host,
        ui,
        events,
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<UpdateEvent>) -> UpdateEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for update event")
        .expect("event stream closed")
}

#[tokio::test]
async fn first_visit_installs_silently() {
    let mut shell = boot_first_visit().await;

    // Let the page loop drain the install events.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*shell.ui.borrow(), UiState::hidden());
    assert!(shell.events.try_recv().is_err());
    assert!(shell.host.active().await.is_some());
    assert!(shell.host.controller().await.is_none());
    assert_eq!(shell.host.storage().read().await.len(), 1);
}

#[tokio::test]
async fn new_version_prompts_and_hands_off() {
    let mut shell = boot_returning_visit().await;

    shell.deploy("2.0", 2);
    assert!(shell.controller.check_for_updates().await.unwrap());

    match next_event(&mut shell.events).await {
        UpdateEvent::UpdateAvailable { version } => {
            assert_eq!(version, VersionTag::new("2.0"));
        }
        other => panic!("expected update available, got {other:?}"),
    }
    assert_eq!(*shell.ui.borrow(), UiState::prompt());

    shell.controller.accept().await;
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::HandoffStarted
    ));

    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::ReloadRequested
    ));
    // The indicator is gone by the time the reload is requested.
    assert_eq!(*shell.ui.borrow(), UiState::hidden());

    // Exactly one reload.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(shell.events.try_recv().is_err());

    // Exactly one bucket remains after activation.
    let storage = shell.host.storage();
    let storage = storage.read().await;
    assert_eq!(storage.len(), 1);
    assert!(storage.has("driftwave-cache-v2"));
}

#[tokio::test]
async fn identical_version_redeploy_is_silent() {
    let mut shell = boot_returning_visit().await;

    // Same tag, new generation: a byte-identical redeploy.
    shell.deploy("1.0", 2);
    assert!(shell.controller.check_for_updates().await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*shell.ui.borrow(), UiState::hidden());
    assert!(shell.events.try_recv().is_err());
    // The candidate keeps waiting; it is just not worth a prompt.
    assert!(shell.host.waiting().await.is_some());
}

#[tokio::test]
async fn deferred_update_renotifies_on_manual_check() {
    let mut shell = boot_returning_visit().await;

    shell.deploy("2.0", 2);
    shell.controller.check_for_updates().await.unwrap();
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::UpdateAvailable { .. }
    ));

    shell.controller.defer().await;
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::UpdateDeferred
    ));
    assert_eq!(*shell.ui.borrow(), UiState::hidden());

    // A manual check later re-offers the same candidate.
    assert!(!shell.controller.check_for_updates().await.unwrap());
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::UpdateAvailable { .. }
    ));
    assert_eq!(*shell.ui.borrow(), UiState::prompt());
}

#[tokio::test]
async fn stalled_handoff_rearms_prompt() {
    let config = test_config();
    let backend = Arc::new(ScriptedBackend::for_manifest(&config.origin, &config.manifest));
    let source = Arc::new(StaticScriptSource::new(blueprint(
        &config.manifest,
        "1.0",
        1,
    )));
    let (host, mut worker_events) = WorkerHost::new(&config, source.clone(), backend);
    host.register().await.unwrap();
    while worker_events.try_recv().is_ok() {}

    // Feed the page a filtered event stream that swallows the controller
    // change, standing in for a handoff the runtime never completes.
    let (filtered_tx, filtered_rx) = mpsc::unbounded_channel();
    let (controller, ui, mut events) = PageController::new(config.clone(), host.clone());
    controller.start(filtered_rx).await.unwrap();

    source.set(blueprint(&config.manifest, "2.0", 2));
    controller.check_for_updates().await.unwrap();
    while let Ok(event) = worker_events.try_recv() {
        if !matches!(event, WorkerEvent::ControllerChange { .. }) {
            filtered_tx.send(event).unwrap();
        }
    }

    assert!(matches!(
        next_event(&mut events).await,
        UpdateEvent::UpdateAvailable { .. }
    ));

    controller.accept().await;
    assert!(matches!(
        next_event(&mut events).await,
        UpdateEvent::HandoffStarted
    ));

    // No controller change arrives; the stall bound passes.
    assert!(matches!(
        next_event(&mut events).await,
        UpdateEvent::HandoffStalled
    ));
    assert_eq!(*ui.borrow(), UiState::prompt());

    // Re-shown exactly once.
    tokio::time::sleep(config.handoff_stall_timeout * 2).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn sequential_handoffs_within_one_page() {
    let mut shell = boot_returning_visit().await;

    shell.deploy("2.0", 2);
    shell.controller.check_for_updates().await.unwrap();
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::UpdateAvailable { .. }
    ));
    shell.controller.accept().await;
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::HandoffStarted
    ));
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::ReloadRequested
    ));

    // The embedding application debounced the reload; a third version
    // ships while the page is still alive.
    shell.deploy("3.0", 3);
    shell.controller.check_for_updates().await.unwrap();
    match next_event(&mut shell.events).await {
        UpdateEvent::UpdateAvailable { version } => {
            assert_eq!(version, VersionTag::new("3.0"));
        }
        other => panic!("expected update available, got {other:?}"),
    }

    shell.controller.accept().await;
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::HandoffStarted
    ));
    assert!(matches!(
        next_event(&mut shell.events).await,
        UpdateEvent::ReloadRequested
    ));

    let storage = shell.host.storage();
    let storage = storage.read().await;
    assert_eq!(storage.len(), 1);
    assert!(storage.has("driftwave-cache-v3"));
}
