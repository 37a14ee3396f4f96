//! End-to-end transfer of an installer source onto a destination volume.
//!
//! A [`TransferCoordinator`] is blocking: run it on a dedicated thread or via
//! `spawn_blocking`. It borrows the two volume handles for its lifetime.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::core::plan::{Placeholders, ProgressFormat, TransferPlan};
use crate::core::process::{ProcessSession, Termination};
use crate::core::progress::{Progress, TransferObserver};
use crate::core::volume::VolumeHandle;
use crate::error::{CancelledError, MountError, TransferError};
use crate::logging::LogThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Pending,
    Confirming,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug)]
pub enum TransferOutcome {
    Succeeded,
    /// `reason` is the first failure; unmount errors hit while cleaning up
    /// afterwards are kept separately.
    Failed {
        reason: TransferError,
        cleanup_errors: Vec<MountError>,
    },
    Cancelled {
        cleanup_errors: Vec<MountError>,
    },
}

impl TransferOutcome {
    pub fn state(&self) -> TransferState {
        match self {
            Self::Succeeded => TransferState::Succeeded,
            Self::Failed { .. } => TransferState::Failed,
            Self::Cancelled { .. } => TransferState::Cancelled,
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Succeeded => None,
            Self::Failed { reason, .. } => Some(reason.to_string()),
            Self::Cancelled { .. } => Some(CancelledError.to_string()),
        }
    }

    pub fn cleanup_errors(&self) -> &[MountError] {
        match self {
            Self::Succeeded => &[],
            Self::Failed { cleanup_errors, .. } | Self::Cancelled { cleanup_errors } => {
                cleanup_errors
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub label: String,
    pub termination: Option<Termination>,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct TransferReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub outcome: TransferOutcome,
}

/// What the user is asked before anything destructive happens.
#[derive(Debug, Clone)]
pub struct ConfirmationPrompt {
    pub header: String,
    pub details: String,
}

impl ConfirmationPrompt {
    fn for_destination(destination: &VolumeHandle, plan: &TransferPlan) -> Self {
        let info = destination.info();
        let steps: Vec<&str> = plan.steps.iter().map(|s| s.label.as_str()).collect();
        Self {
            header: format!("Erase \"{}\"?", info.label),
            details: format!(
                "All data on {} ({}, {}) will be erased and replaced. Steps: {}.",
                info.label,
                info.devnode.display(),
                format_size(info.size),
                steps.join(", ")
            ),
        }
    }
}

pub trait Confirm {
    fn confirm(&self, prompt: &ConfirmationPrompt) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&ConfirmationPrompt) -> bool,
{
    fn confirm(&self, prompt: &ConfirmationPrompt) -> bool {
        self(prompt)
    }
}

struct Control {
    state: Mutex<TransferState>,
    token: CancellationToken,
    current: Mutex<Option<Arc<ProcessSession>>>,
}

impl Control {
    fn state(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<ProcessSession>>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Requests cancellation of a running transfer from another thread.
#[derive(Clone)]
pub struct CancelHandle {
    control: Arc<Control>,
}

impl CancelHandle {
    /// Returns false when the transfer is not confirming or running.
    pub fn cancel(&self) -> bool {
        {
            let state = self.control.state();
            if !matches!(*state, TransferState::Confirming | TransferState::Running) {
                return false;
            }
            self.control.token.cancel();
        }

        info!("Transfer cancellation requested");
        if let Some(session) = self.control.current().clone() {
            if let Err(e) = session.kill(Signal::SIGTERM) {
                debug!(error = %e, "In-flight step already gone");
            }
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.token.is_cancelled()
    }
}

pub struct TransferCoordinator<'a> {
    id: Uuid,
    source: &'a VolumeHandle,
    destination: &'a VolumeHandle,
    plan: TransferPlan,
    observer: Arc<dyn TransferObserver>,
    runtime: Handle,
    control: Arc<Control>,
}

impl<'a> TransferCoordinator<'a> {
    pub fn new(
        source: &'a VolumeHandle,
        destination: &'a VolumeHandle,
        plan: TransferPlan,
        observer: Arc<dyn TransferObserver>,
        runtime: Handle,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source,
            destination,
            plan,
            observer,
            runtime,
            control: Arc::new(Control {
                state: Mutex::new(TransferState::Pending),
                token: CancellationToken::new(),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransferState {
        *self.control.state()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            control: self.control.clone(),
        }
    }

    /// Run the transfer to completion. Blocks the calling thread.
    pub fn run(self, confirm: &dyn Confirm) -> TransferReport {
        let span = info_span!(
            "transfer",
            id = %self.id,
            source = %self.source.id(),
            destination = %self.destination.id()
        );
        let _entered = span.enter();

        let started_at = Utc::now();
        let mut steps = Vec::new();
        let outcome = self.drive(confirm, &mut steps);

        match &outcome {
            TransferOutcome::Succeeded => info!("Transfer succeeded"),
            TransferOutcome::Failed { reason, .. } => error!(error = %reason, "Transfer failed"),
            TransferOutcome::Cancelled { .. } => warn!("Transfer cancelled"),
        }

        self.set_state(outcome.state());
        self.observer.on_result(&outcome);

        TransferReport {
            id: self.id,
            started_at,
            finished_at: Utc::now(),
            steps,
            outcome,
        }
    }

    fn drive(&self, confirm: &dyn Confirm, steps: &mut Vec<StepReport>) -> TransferOutcome {
        self.set_state(TransferState::Confirming);

        let prompt = ConfirmationPrompt::for_destination(self.destination, &self.plan);
        if self.is_cancelled() || !confirm.confirm(&prompt) {
            info!("Transfer not confirmed");
            return TransferOutcome::Cancelled {
                cleanup_errors: Vec::new(),
            };
        }

        {
            let mut state = self.control.state();
            if self.is_cancelled() {
                return TransferOutcome::Cancelled {
                    cleanup_errors: Vec::new(),
                };
            }
            *state = TransferState::Running;
        }
        self.observer.on_state(TransferState::Running);

        let result = self.execute(steps);
        let cleanup_errors = self.cleanup();

        match result {
            Err(TransferError::Cancelled(_)) => TransferOutcome::Cancelled { cleanup_errors },
            Err(reason) => TransferOutcome::Failed {
                reason,
                cleanup_errors,
            },
            Ok(()) => {
                let mut cleanup_errors = cleanup_errors;
                if cleanup_errors.is_empty() {
                    TransferOutcome::Succeeded
                } else {
                    let first = cleanup_errors.remove(0);
                    TransferOutcome::Failed {
                        reason: TransferError::Mount(first),
                        cleanup_errors,
                    }
                }
            }
        }
    }

    fn execute(&self, reports: &mut Vec<StepReport>) -> Result<(), TransferError> {
        self.check_cancelled()?;
        self.observer
            .on_progress("Mounting source", Progress::Indeterminate);
        let source_mount = self.source.mount()?;

        self.check_cancelled()?;
        self.observer
            .on_progress("Mounting destination", Progress::Indeterminate);
        let destination_mount = self.destination.mount()?;

        if self.destination.exclusive_access() {
            self.destination
                .ensure_exclusive()
                .map_err(|e| match e {
                    MountError::ExclusiveAccess(held) => TransferError::ExclusiveAccess(held),
                    other => TransferError::Mount(other),
                })?;
        }

        let values = Placeholders {
            source: source_mount,
            destination: destination_mount,
            base_system: self.source.base_system_path(),
            install_payload: self.source.install_payload_path(),
            destination_device: self.destination.info().devnode,
        };

        for (index, step) in self.plan.steps.iter().enumerate() {
            self.check_cancelled()?;

            let args = step.expand_args(&values)?;
            info!(
                step = %step.label,
                index = index + 1,
                total = self.plan.len(),
                "Starting step"
            );

            let session = Arc::new(
                ProcessSession::new(step.program.clone())
                    .args(args)
                    .runtime(self.runtime.clone()),
            );

            let parser = step.progress;
            if parser != ProgressFormat::None {
                let observer = self.observer.clone();
                let label = step.label.clone();
                let throttle = LogThrottle::new(Duration::from_millis(500));
                session.on_output(move |line| {
                    if let Some(fraction) = parser.parse(line) {
                        if throttle.should_log() {
                            debug!(step = %label, fraction, "Step progress");
                        }
                        observer.on_progress(&label, Progress::Fraction(fraction));
                    }
                });
                self.observer.on_progress(&step.label, Progress::Fraction(0.0));
            } else {
                self.observer.on_progress(&step.label, Progress::Indeterminate);
            }

            let started = Instant::now();
            *self.control.current() = Some(session.clone());
            if let Err(source) = session.launch() {
                self.control.current().take();
                reports.push(StepReport {
                    label: step.label.clone(),
                    termination: None,
                    duration: started.elapsed(),
                });
                return Err(TransferError::Launch {
                    step: step.label.clone(),
                    source,
                });
            }
            if self.is_cancelled() {
                let _ = session.kill(Signal::SIGTERM);
            }

            let result = session.wait_for_success();
            self.control.current().take();

            reports.push(StepReport {
                label: step.label.clone(),
                termination: session.termination(),
                duration: started.elapsed(),
            });

            // A step killed by cancellation fails; one that finished anyway
            // counts, and the next iteration stops the plan.
            if result.is_err() {
                self.check_cancelled()?;
            }
            result.map_err(|source| TransferError::Process {
                step: step.label.clone(),
                source,
            })?;

            info!(step = %step.label, elapsed_secs = started.elapsed().as_secs(), "Step complete");
            self.observer
                .on_progress(&step.label, Progress::Fraction(1.0));
        }

        Ok(())
    }

    /// Unmount both volumes, destination first. Runs whatever happened before.
    fn cleanup(&self) -> Vec<MountError> {
        self.observer
            .on_progress("Unmounting volumes", Progress::Indeterminate);

        let mut errors = Vec::new();
        for volume in [self.destination, self.source] {
            if volume.mountpoint().is_none() || volume.is_removed() {
                continue;
            }
            if let Err(e) = volume.unmount() {
                warn!(device = %volume.id(), error = %e, "Cleanup unmount failed");
                errors.push(e);
            }
        }
        errors
    }

    fn set_state(&self, state: TransferState) {
        *self.control.state() = state;
        self.observer.on_state(state);
    }

    fn is_cancelled(&self) -> bool {
        self.control.token.is_cancelled()
    }

    fn check_cancelled(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            return Err(CancelledError);
        }
        Ok(())
    }
}

/// Run a transfer on the blocking pool and await its report.
pub async fn run_blocking<C>(
    source: VolumeHandle,
    destination: VolumeHandle,
    plan: TransferPlan,
    observer: Arc<dyn TransferObserver>,
    confirm: C,
    on_start: impl FnOnce(CancelHandle) + Send + 'static,
) -> anyhow::Result<TransferReport>
where
    C: Confirm + Send + 'static,
{
    let runtime = Handle::current();
    let span = info_span!("run_blocking");
    tokio::task::spawn_blocking(move || {
        let coordinator =
            TransferCoordinator::new(&source, &destination, plan, observer, runtime);
        on_start(coordinator.cancel_handle());
        coordinator.run(&confirm)
    })
    .instrument(span)
    .await
    .map_err(|e| anyhow::anyhow!("transfer task panicked: {}", e))
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
