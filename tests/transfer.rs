//! Full transfers against simulated volumes, running real processes.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::UnboundedReceiver;
use xrecovery::adapters::{SimulatedArbiter, Simulator};
use xrecovery::core::coordinator::{self, CancelHandle, ConfirmationPrompt};
use xrecovery::core::{
    ChannelObserver, DeviceFilter, DiskArbiter, Progress, ProgressFormat, RegistryOptions,
    StepSpec, TransferEvent, TransferObserver, TransferOutcome, TransferPlan, TransferState,
    VolumeHandle, VolumeOptions, VolumeRegistry,
};
use xrecovery::error::{OpenReference, TransferError};

struct Fixture {
    _temp: TempDir,
    simulator: Simulator,
    source: VolumeHandle,
    destination: VolumeHandle,
}

/// A directory-backed installer image with a base system and payload, and
/// one 16 GB removable destination.
fn fixture() -> Fixture {
    let temp = tempdir().unwrap();
    let image = temp.path().join("Installer");
    fs::create_dir_all(image.join("BaseSystem/etc")).unwrap();
    fs::create_dir_all(image.join("Packages")).unwrap();
    fs::write(image.join("BaseSystem/etc/release"), b"1.0\n").unwrap();
    fs::write(image.join("Packages/base.pkg"), b"payload\n").unwrap();

    let (arbiter, simulator) = SimulatedArbiter::new();
    let arbiter: Arc<dyn DiskArbiter> = Arc::new(arbiter);
    let registry = VolumeRegistry::new(
        arbiter,
        RegistryOptions {
            filter: DeviceFilter::default(),
            volume: VolumeOptions {
                mount_base: temp.path().join("mnt"),
                timeout: Duration::from_secs(5),
            },
            ..RegistryOptions::default()
        },
    );

    registry.register_image(&image);
    simulator.add_image("loop0", &image);
    simulator.add_device("usb", 16);
    registry.scan().unwrap();

    Fixture {
        source: registry.source_for_image(&image).expect("source"),
        destination: registry.get("usb").expect("destination"),
        _temp: temp,
        simulator,
    }
}

fn copy_plan() -> TransferPlan {
    TransferPlan::new(
        vec![
            StepSpec::new(
                "Restoring base system",
                "cp",
                &["-R", "{base_system}/.", "{destination}/"],
                ProgressFormat::None,
            ),
            StepSpec::new(
                "Copying installer payload",
                "cp",
                &["-R", "{install_payload}", "{destination}/"],
                ProgressFormat::None,
            ),
        ],
        &[],
    )
}

fn drain(mut rx: UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn accept(_: &ConfirmationPrompt) -> bool {
    true
}

fn destination_dir(f: &Fixture) -> std::path::PathBuf {
    f.destination.default_mountpoint()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_successful_transfer() {
    let f = fixture();
    let (observer, rx) = ChannelObserver::new();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        copy_plan(),
        observer,
        accept,
        |_| {},
    )
    .await
    .unwrap();

    assert!(
        matches!(report.outcome, TransferOutcome::Succeeded),
        "outcome: {:?}",
        report.outcome
    );
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|s| s.termination.is_some_and(|t| t.success())));
    assert!(report.finished_at >= report.started_at);

    let dest = destination_dir(&f);
    assert_eq!(fs::read_to_string(dest.join("etc/release")).unwrap(), "1.0\n");
    assert!(dest.join("Packages/base.pkg").is_file());

    assert!(!f.simulator.is_mounted("loop0"));
    assert!(!f.simulator.is_mounted("usb"));
    assert_eq!(f.source.mountpoint(), None);

    let events = drain(rx);
    assert!(events.contains(&TransferEvent::State(TransferState::Confirming)));
    assert!(events.contains(&TransferEvent::State(TransferState::Running)));
    assert_eq!(
        events.last(),
        Some(&TransferEvent::Finished {
            state: TransferState::Succeeded,
            reason: None,
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_step_stops_transfer_and_cleans_up() {
    let f = fixture();
    let marker = destination_dir(&f).join("never");
    let plan = TransferPlan::new(
        vec![
            StepSpec::new("Preparing", "true", &[], ProgressFormat::None),
            StepSpec::new(
                "Breaking",
                "sh",
                &["-c", "echo partial; echo boom >&2; exit 3"],
                ProgressFormat::None,
            ),
            StepSpec::new(
                "Unreachable",
                "touch",
                &["{destination}/never"],
                ProgressFormat::None,
            ),
        ],
        &[],
    );
    let (observer, rx) = ChannelObserver::new();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        plan,
        observer,
        accept,
        |_| {},
    )
    .await
    .unwrap();

    match &report.outcome {
        TransferOutcome::Failed {
            reason: TransferError::Process { step, source },
            cleanup_errors,
        } => {
            assert_eq!(step, "Breaking");
            assert_eq!(source.termination.status, 3);
            assert!(source.output.contains("boom"));
            assert!(source.output.contains("partial"));
            assert!(cleanup_errors.is_empty());
        }
        other => panic!("expected process failure, got {other:?}"),
    }
    assert_eq!(report.steps.len(), 2);
    assert!(!marker.exists());
    assert!(!f.simulator.is_mounted("loop0"));
    assert!(!f.simulator.is_mounted("usb"));

    let events = drain(rx);
    match events.last() {
        Some(TransferEvent::Finished {
            state: TransferState::Failed,
            reason: Some(reason),
        }) => assert!(reason.contains("Breaking")),
        other => panic!("unexpected final event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_program_fails_to_launch() {
    let f = fixture();
    let plan = TransferPlan::new(
        vec![StepSpec::new(
            "Imaging",
            "/nonexistent/imaging-tool",
            &[],
            ProgressFormat::None,
        )],
        &[],
    );
    let (observer, _rx) = ChannelObserver::new();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        plan,
        observer,
        accept,
        |_| {},
    )
    .await
    .unwrap();

    assert!(matches!(
        report.outcome,
        TransferOutcome::Failed {
            reason: TransferError::Launch { .. },
            ..
        }
    ));
    assert!(!f.simulator.is_mounted("usb"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_declined_confirmation_touches_nothing() {
    let f = fixture();
    let (observer, rx) = ChannelObserver::new();
    let seen: Arc<Mutex<Option<ConfirmationPrompt>>> = Arc::new(Mutex::new(None));
    let captured = seen.clone();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        copy_plan(),
        observer,
        move |prompt: &ConfirmationPrompt| {
            *captured.lock().unwrap() = Some(prompt.clone());
            false
        },
        |_| {},
    )
    .await
    .unwrap();

    assert!(matches!(report.outcome, TransferOutcome::Cancelled { .. }));
    assert!(report.steps.is_empty());
    assert!(f.simulator.operations("usb").is_empty());
    assert!(f.simulator.operations("loop0").is_empty());

    let prompt = seen.lock().unwrap().clone().expect("prompt shown");
    assert!(prompt.header.contains("TEST_DEVICE_usb"));
    assert!(prompt.details.contains("Restoring base system"));

    let events = drain(rx);
    assert!(!events.contains(&TransferEvent::State(TransferState::Running)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_kills_running_step() {
    let f = fixture();
    let plan = TransferPlan::new(
        vec![
            StepSpec::new("Waiting", "sleep", &["30"], ProgressFormat::None),
            StepSpec::new(
                "Unreachable",
                "touch",
                &["{destination}/never"],
                ProgressFormat::None,
            ),
        ],
        &[],
    );
    let marker = destination_dir(&f).join("never");
    let (observer, mut rx) = ChannelObserver::new();
    let (handle_tx, handle_rx) = std::sync::mpsc::channel::<CancelHandle>();

    let started = Instant::now();
    let transfer = tokio::spawn(coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        plan,
        observer,
        accept,
        move |cancel| {
            let _ = handle_tx.send(cancel);
        },
    ));

    let cancel = tokio::task::spawn_blocking(move || handle_rx.recv().unwrap())
        .await
        .unwrap();

    // Wait for the long step to start before cancelling.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(TransferEvent::Progress { label, .. })) if label == "Waiting" => break,
            Ok(Some(_)) => continue,
            other => panic!("transfer never reached the long step: {other:?}"),
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cancel.cancel());
    assert!(cancel.is_cancelled());

    let report = transfer.await.unwrap().unwrap();

    assert!(matches!(report.outcome, TransferOutcome::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(!marker.exists());
    assert!(!f.simulator.is_mounted("usb"));
    assert!(!f.simulator.is_mounted("loop0"));
    // Cancelling a finished transfer is refused.
    assert!(!cancel.cancel());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exclusive_access_blocks_writes() {
    let f = fixture();
    f.destination.set_exclusive_access(true);
    f.simulator.set_open_references(
        "usb",
        vec![OpenReference {
            pid: 999,
            command: "indexer".to_string(),
            writable: true,
        }],
    );
    let marker = destination_dir(&f).join("never");
    let plan = TransferPlan::new(
        vec![StepSpec::new(
            "Writing",
            "touch",
            &["{destination}/never"],
            ProgressFormat::None,
        )],
        &[],
    );
    let (observer, _rx) = ChannelObserver::new();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        plan,
        observer,
        accept,
        |_| {},
    )
    .await
    .unwrap();

    match &report.outcome {
        TransferOutcome::Failed {
            reason: TransferError::ExclusiveAccess(held),
            cleanup_errors,
        } => {
            assert_eq!(held.holders[0].command, "indexer");
            // The writer still holds the destination, so it stays mounted.
            assert_eq!(cleanup_errors.len(), 1);
        }
        other => panic!("expected exclusive access failure, got {other:?}"),
    }
    assert!(report.steps.is_empty());
    assert!(!marker.exists());
    assert!(!f.simulator.is_mounted("loop0"));
    assert!(f.simulator.is_mounted("usb"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_rsync_plan_copies_files() {
    if std::process::Command::new("rsync")
        .arg("--version")
        .output()
        .is_err()
    {
        eprintln!("Skipping: rsync not available");
        return;
    }

    let f = fixture();
    let (observer, _rx) = ChannelObserver::new();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        TransferPlan::default(),
        observer,
        accept,
        |_| {},
    )
    .await
    .unwrap();

    assert!(
        matches!(report.outcome, TransferOutcome::Succeeded),
        "outcome: {:?}",
        report.outcome
    );
    let dest = destination_dir(&f);
    assert!(Path::new(&dest.join("etc/release")).is_file());
    assert!(dest.join("Packages/base.pkg").is_file());
}

/// Records every fraction with the time it arrived.
#[derive(Default)]
struct TimedObserver {
    fractions: Mutex<Vec<(Instant, String, f64)>>,
}

impl TransferObserver for TimedObserver {
    fn on_progress(&self, label: &str, progress: Progress) {
        if let Progress::Fraction(fraction) = progress {
            self.fractions
                .lock()
                .unwrap()
                .push((Instant::now(), label.to_string(), fraction));
        }
    }

    fn on_result(&self, _outcome: &TransferOutcome) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_carriage_return_progress_reaches_observer_while_step_runs() {
    let f = fixture();
    let plan = TransferPlan::new(
        vec![StepSpec::new(
            "Restoring base system",
            "sh",
            &[
                "-c",
                "printf '  100  10%%\\r'; sleep 1; printf '  500  50%%\\r'; sleep 1; printf '  900 100%%\\n'",
            ],
            ProgressFormat::Rsync,
        )],
        &[],
    );
    let observer = Arc::new(TimedObserver::default());

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        plan,
        observer.clone(),
        accept,
        |_| {},
    )
    .await
    .unwrap();
    assert!(
        matches!(report.outcome, TransferOutcome::Succeeded),
        "outcome: {:?}",
        report.outcome
    );

    let fractions = observer.fractions.lock().unwrap().clone();
    let at = |wanted: f64| {
        fractions
            .iter()
            .find(|(_, label, f)| label == "Restoring base system" && *f == wanted)
            .map(|(when, _, _)| *when)
            .unwrap_or_else(|| panic!("fraction {wanted} never arrived: {fractions:?}"))
    };
    let tenth = at(0.1);
    let half = at(0.5);
    let done = at(1.0);
    assert!(tenth < half);
    assert!(done.duration_since(half) >= Duration::from_millis(500));
    assert!(half.duration_since(tenth) >= Duration::from_millis(500));
}

/// Cancels the transfer as soon as the given step reports completion.
struct CancelAfterStep {
    step: &'static str,
    cancel: Mutex<Option<CancelHandle>>,
    accepted: Mutex<Option<bool>>,
}

impl TransferObserver for CancelAfterStep {
    fn on_progress(&self, label: &str, progress: Progress) {
        if label == self.step && progress == Progress::Fraction(1.0) {
            if let Some(cancel) = self.cancel.lock().unwrap().as_ref() {
                *self.accepted.lock().unwrap() = Some(cancel.cancel());
            }
        }
    }

    fn on_result(&self, _outcome: &TransferOutcome) {}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_after_last_step_completes_still_succeeds() {
    let f = fixture();
    let observer = Arc::new(CancelAfterStep {
        step: "Copying installer payload",
        cancel: Mutex::new(None),
        accepted: Mutex::new(None),
    });
    let slot = observer.clone();

    let report = coordinator::run_blocking(
        f.source.clone(),
        f.destination.clone(),
        copy_plan(),
        observer.clone(),
        accept,
        move |cancel| {
            *slot.cancel.lock().unwrap() = Some(cancel);
        },
    )
    .await
    .unwrap();

    assert_eq!(*observer.accepted.lock().unwrap(), Some(true));
    assert!(
        matches!(report.outcome, TransferOutcome::Succeeded),
        "outcome: {:?}",
        report.outcome
    );
    assert_eq!(report.steps.len(), 2);
    let dest = destination_dir(&f);
    assert!(dest.join("Packages/base.pkg").is_file());
    assert!(!f.simulator.is_mounted("usb"));
}
