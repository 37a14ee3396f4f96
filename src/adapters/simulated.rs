use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::hardware::{
    BlockDevice, DiskArbiter, HardwareEvent, MatchCriteria, MountRequest, UnmountRequest,
};
use crate::core::volume::Completion;
use crate::error::{Dissent, OpenReference};

enum SimulatedCommand {
    InjectAdd(BlockDevice),
    InjectRemove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedOp {
    Mount(PathBuf),
    Unmount { force: bool },
}

#[derive(Default)]
struct SimState {
    devices: Vec<BlockDevice>,
    mounted: HashMap<String, PathBuf>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    history: HashMap<String, Vec<SimulatedOp>>,
    fail_next: HashMap<String, Dissent>,
    open_references: HashMap<String, Vec<OpenReference>>,
    delay: Duration,
    hold: bool,
    held: Vec<(String, Completion)>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

/// Controller used by tests and `--simulation` to plug devices in and out and
/// to script how the arbiter answers.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    pub fn add_device(&self, uuid: &str, size_gb: u64) {
        let device = BlockDevice {
            id: uuid.to_string(),
            criteria: MatchCriteria {
                uuid: Some(uuid.to_string()),
                devnode: None,
            },
            devnode: PathBuf::from(format!("/dev/sim/{}", uuid)),
            label: format!("TEST_DEVICE_{}", uuid),
            details: "Simulated removable disk".to_string(),
            icon: "drive-removable-media".to_string(),
            capacity: size_gb * 1024 * 1024 * 1024,
            filesystem: "vfat".to_string(),
            removable: true,
            backing_file: None,
            mount_point: None,
        };
        self.add_volume(device);
    }

    /// Plug in an installer image. `backing_file` is what the registry
    /// matches against attached images.
    pub fn add_image(&self, uuid: &str, backing_file: &Path) {
        let device = BlockDevice {
            id: uuid.to_string(),
            criteria: MatchCriteria {
                uuid: Some(uuid.to_string()),
                devnode: None,
            },
            devnode: PathBuf::from(format!("/dev/sim/{}", uuid)),
            label: backing_file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| uuid.to_string()),
            details: "Simulated installer image".to_string(),
            icon: "media-optical".to_string(),
            capacity: 6 * 1024 * 1024 * 1024,
            filesystem: "iso9660".to_string(),
            removable: false,
            backing_file: Some(backing_file.to_path_buf()),
            mount_point: None,
        };
        self.add_volume(device);
    }

    pub fn add_volume(&self, device: BlockDevice) {
        {
            let mut state = lock(&self.state);
            state.devices.retain(|d| d.id != device.id);
            state.devices.push(device.clone());
        }
        let _ = self.tx.send(SimulatedCommand::InjectAdd(device));
    }

    /// Unplug a device. Completions held for it are dropped, which the
    /// waiting handle observes as the device vanishing.
    pub fn remove_device(&self, uuid: &str) {
        let dropped: Vec<Completion> = {
            let mut state = lock(&self.state);
            state.devices.retain(|d| d.id != uuid);
            state.mounted.remove(uuid);
            let (gone, kept): (Vec<_>, Vec<_>) =
                state.held.drain(..).partition(|(id, _)| id == uuid);
            state.held = kept;
            gone.into_iter().map(|(_, c)| c).collect()
        };
        drop(dropped);

        let _ = self
            .tx
            .send(SimulatedCommand::InjectRemove(uuid.to_string()));
    }

    /// Delay before each completion is delivered.
    pub fn set_completion_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    /// Keep completions instead of delivering them.
    pub fn hold_completions(&self, hold: bool) {
        lock(&self.state).hold = hold;
    }

    /// Deliver every held completion as a success.
    pub fn release_held(&self) {
        let held: Vec<(String, Completion)> = lock(&self.state).held.drain(..).collect();
        for (_, completion) in held {
            completion.complete(Ok(None));
        }
    }

    pub fn fail_next(&self, uuid: &str, dissent: Dissent) {
        lock(&self.state).fail_next.insert(uuid.to_string(), dissent);
    }

    pub fn set_open_references(&self, uuid: &str, holders: Vec<OpenReference>) {
        lock(&self.state)
            .open_references
            .insert(uuid.to_string(), holders);
    }

    pub fn is_mounted(&self, uuid: &str) -> bool {
        lock(&self.state).mounted.contains_key(uuid)
    }

    /// Highest number of simultaneously outstanding requests seen for a device.
    pub fn max_concurrent(&self, uuid: &str) -> usize {
        lock(&self.state)
            .max_in_flight
            .get(uuid)
            .copied()
            .unwrap_or(0)
    }

    pub fn operations(&self, uuid: &str) -> Vec<SimulatedOp> {
        lock(&self.state)
            .history
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct SimulatedArbiter {
    // We wrap the receiver in a Mutex so we can move it out inside `start()`
    // which takes &self. (Start is only called once).
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<SimulatedCommand>>>,
    state: Arc<Mutex<SimState>>,
    shutdown: CancellationToken,
}

impl SimulatedArbiter {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SimState::default()));

        (
            Self {
                cmd_rx: Mutex::new(Some(rx)),
                state: state.clone(),
                shutdown: CancellationToken::new(),
            },
            Simulator { tx, state },
        )
    }

    fn begin(&self, device: &str, op: SimulatedOp) -> (Duration, bool) {
        let mut state = lock(&self.state);
        let count = {
            let entry = state.in_flight.entry(device.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let max = state.max_in_flight.entry(device.to_string()).or_insert(0);
        *max = (*max).max(count);
        state
            .history
            .entry(device.to_string())
            .or_default()
            .push(op);
        (state.delay, state.hold)
    }

    fn end(state: &Mutex<SimState>, device: &str) {
        let mut state = lock(state);
        if let Some(count) = state.in_flight.get_mut(device) {
            *count = count.saturating_sub(1);
        }
    }

    /// Run `work` on a background thread after the configured delay, then
    /// deliver its answer, or park the completion when holding.
    fn dispatch<F>(&self, device: String, completion: Completion, delay: Duration, hold: bool, work: F)
    where
        F: FnOnce(&mut SimState) -> Result<Option<PathBuf>, Dissent> + Send + 'static,
    {
        let state = self.state.clone();
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }

            let result = work(&mut lock(&state));
            Self::end(&state, &device);

            if hold {
                let mut guard = lock(&state);
                if guard.devices.iter().any(|d| d.id == device) {
                    debug!(device = %device, "(Simulator) Holding completion");
                    guard.held.push((device, completion));
                    return;
                }
                drop(guard);
                drop(completion);
                return;
            }
            completion.complete(result);
        });
    }
}

impl DiskArbiter for SimulatedArbiter {
    fn start(&self, daemon_tx: mpsc::Sender<HardwareEvent>) {
        let Some(mut rx) = self.cmd_rx.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            debug!("(SimulatedArbiter) start() called twice");
            return;
        };
        let shutdown = self.shutdown.clone();

        debug!("(SimulatedArbiter) Listening for controller commands");

        // Bridge task
        tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };

                let event = match cmd {
                    SimulatedCommand::InjectAdd(device) => HardwareEvent::DeviceAdded(device),
                    SimulatedCommand::InjectRemove(uuid) => HardwareEvent::DeviceRemoved(uuid),
                };

                if daemon_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>> {
        let state = lock(&self.state);
        Ok(state
            .devices
            .iter()
            .map(|d| {
                let mut d = d.clone();
                d.mount_point = state.mounted.get(&d.id).cloned();
                d
            })
            .collect())
    }

    fn mount(&self, request: MountRequest, completion: Completion) {
        let device = completion.device().to_string();
        let (delay, hold) = self.begin(&device, SimulatedOp::Mount(request.mountpoint.clone()));

        self.dispatch(device, completion, delay, hold, move |state| {
            let Some((found, backing)) = state
                .devices
                .iter()
                .find(|d| request.criteria.matches(d))
                .map(|d| (d.id.clone(), d.backing_file.clone()))
            else {
                return Err(Dissent::new(
                    libc::ENODEV,
                    format!("no disk matches {}", request.criteria),
                ));
            };

            if let Some(dissent) = state.fail_next.remove(&found) {
                return Err(dissent);
            }

            // An image backed by a directory is "mounted" in place.
            let mountpoint = match backing {
                Some(dir) if dir.is_dir() => dir,
                _ => {
                    std::fs::create_dir_all(&request.mountpoint).map_err(|e| {
                        Dissent::new(e.raw_os_error().unwrap_or(libc::EIO), e.to_string())
                    })?;
                    request.mountpoint
                }
            };
            state.mounted.insert(found, mountpoint.clone());
            Ok(Some(mountpoint))
        });
    }

    fn unmount(&self, request: UnmountRequest, completion: Completion) {
        let device = completion.device().to_string();
        let (delay, hold) = self.begin(
            &device,
            SimulatedOp::Unmount {
                force: request.force,
            },
        );

        self.dispatch(device, completion, delay, hold, move |state| {
            let Some(found) = state
                .devices
                .iter()
                .find(|d| request.criteria.matches(d))
                .map(|d| d.id.clone())
            else {
                return Err(Dissent::new(
                    libc::ENODEV,
                    format!("no disk matches {}", request.criteria),
                ));
            };

            if let Some(dissent) = state.fail_next.remove(&found) {
                return Err(dissent);
            }
            if !state.mounted.contains_key(&found) {
                return Err(Dissent::new(libc::EINVAL, "not mounted"));
            }
            let busy = state
                .open_references
                .get(&found)
                .is_some_and(|holders| !holders.is_empty());
            if busy && !request.force {
                return Err(Dissent::new(libc::EBUSY, "target is busy"));
            }

            state.mounted.remove(&found);
            Ok(None)
        });
    }

    fn open_references(&self, mountpoint: &Path) -> anyhow::Result<Vec<OpenReference>> {
        let state = lock(&self.state);
        let holders = state
            .mounted
            .iter()
            .find(|(_, mp)| mp.as_path() == mountpoint)
            .and_then(|(id, _)| state.open_references.get(id))
            .cloned()
            .unwrap_or_default();
        Ok(holders)
    }
}
