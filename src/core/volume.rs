//! Volume handles with blocking mount/unmount.
//!
//! The arbiter completes mounts asynchronously. Each call on a
//! [`VolumeHandle`] arms a fresh one-shot channel tagged with an operation id,
//! hands the arbiter a [`Completion`] carrying that id and a weak reference
//! back to the handle, and blocks until the completion is delivered, the
//! device is removed, or the timeout elapses. Calls on one handle are
//! serialized: a second call queues until the first has resolved.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::hardware::{BlockDevice, DiskArbiter, MatchCriteria, MountRequest, UnmountRequest};
use crate::error::{Dissent, ExclusiveAccessError, MountError, OpenReference};

pub type OperationId = u64;

type Outcome = Result<Option<PathBuf>, MountError>;

/// Paths of the installer content, relative to a source's mountpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLayout {
    pub base_system: PathBuf,
    pub install_payload: PathBuf,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            base_system: PathBuf::from("BaseSystem"),
            install_payload: PathBuf::from("Packages"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum VolumeRole {
    Source(SourceLayout),
    Destination { exclusive_access: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolumeKind {
    Source,
    Destination,
}

#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub mount_base: PathBuf,
    pub timeout: Duration,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            mount_base: PathBuf::from("/run/xrecovery"),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of a volume's descriptive attributes.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeInfo {
    pub id: String,
    pub label: String,
    pub details: String,
    pub icon: String,
    pub size: u64,
    pub filesystem: String,
    pub devnode: PathBuf,
    pub mountpoint: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct SourcePaths {
    base_system: PathBuf,
    install_payload: PathBuf,
}

enum Role {
    Source {
        layout: SourceLayout,
        paths: RwLock<Option<SourcePaths>>,
    },
    Destination {
        exclusive_access: AtomicBool,
    },
}

struct Pending {
    op: OperationId,
    tx: SyncSender<Outcome>,
}

pub(crate) struct VolumeShared {
    id: String,
    arbiter: Arc<dyn DiskArbiter>,
    options: VolumeOptions,
    role: Role,
    info: RwLock<VolumeInfo>,
    criteria: RwLock<MatchCriteria>,
    backing_file: RwLock<Option<PathBuf>>,
    gate: Mutex<()>,
    pending: Mutex<Option<Pending>>,
    last_result: Mutex<Option<Result<(), MountError>>>,
    next_op: AtomicU64,
    removed: AtomicBool,
    managed: AtomicBool,
}

impl VolumeShared {
    fn pending(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn resolve(&self, op: OperationId, outcome: Outcome) {
        let mut pending = self.pending();
        match pending.take() {
            Some(armed) if armed.op == op => {
                // Full or disconnected only if the waiter already gave up.
                let _ = armed.tx.try_send(outcome);
            }
            other => {
                *pending = other;
                debug!(device = %self.id, op, "Dropping stale completion");
            }
        }
    }
}

/// Typed callback context handed to the arbiter for one operation.
pub struct Completion {
    op: OperationId,
    device: String,
    target: Weak<VolumeShared>,
    done: bool,
}

impl Completion {
    /// A completion nobody waits on, for fire-and-forget requests.
    pub fn detached(device: impl Into<String>) -> Self {
        Self {
            op: 0,
            device: device.into(),
            target: Weak::new(),
            done: false,
        }
    }

    pub fn operation(&self) -> OperationId {
        self.op
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Deliver the arbiter's answer. `Ok(Some(path))` reports the actual
    /// mountpoint when it differs from the requested one.
    pub fn complete(mut self, result: Result<Option<PathBuf>, Dissent>) {
        self.done = true;
        let outcome = result.map_err(|dissent| MountError::Dissented {
            device: self.device.clone(),
            dissent,
        });
        self.deliver(outcome);
    }

    fn deliver(&self, outcome: Outcome) {
        if let Some(shared) = self.target.upgrade() {
            shared.resolve(self.op, outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.done {
            self.deliver(Err(MountError::Vanished {
                device: self.device.clone(),
            }));
        }
    }
}

/// A discovered volume. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct VolumeHandle {
    shared: Arc<VolumeShared>,
}

impl std::fmt::Debug for VolumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHandle")
            .field("id", &self.shared.id)
            .field("kind", &self.kind())
            .finish()
    }
}

impl VolumeHandle {
    pub fn new(
        device: &BlockDevice,
        role: VolumeRole,
        arbiter: Arc<dyn DiskArbiter>,
        options: VolumeOptions,
    ) -> Self {
        let role = match role {
            VolumeRole::Source(layout) => Role::Source {
                layout,
                paths: RwLock::new(None),
            },
            VolumeRole::Destination { exclusive_access } => Role::Destination {
                exclusive_access: AtomicBool::new(exclusive_access),
            },
        };

        let handle = Self {
            shared: Arc::new(VolumeShared {
                id: device.id.clone(),
                arbiter,
                options,
                role,
                info: RwLock::new(info_from_device(device)),
                criteria: RwLock::new(device.criteria.clone()),
                backing_file: RwLock::new(device.backing_file.clone()),
                gate: Mutex::new(()),
                pending: Mutex::new(None),
                last_result: Mutex::new(None),
                next_op: AtomicU64::new(0),
                removed: AtomicBool::new(false),
                managed: AtomicBool::new(false),
            }),
        };

        if let Some(mountpoint) = &device.mount_point {
            handle.populate_source_paths(mountpoint);
        }
        handle
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn kind(&self) -> VolumeKind {
        match self.shared.role {
            Role::Source { .. } => VolumeKind::Source,
            Role::Destination { .. } => VolumeKind::Destination,
        }
    }

    pub fn info(&self) -> VolumeInfo {
        self.shared
            .info
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn label(&self) -> String {
        self.info().label
    }

    pub fn size(&self) -> u64 {
        self.info().size
    }

    pub fn mountpoint(&self) -> Option<PathBuf> {
        self.info().mountpoint
    }

    pub fn criteria(&self) -> MatchCriteria {
        self.shared
            .criteria
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn backing_file(&self) -> Option<PathBuf> {
        self.shared
            .backing_file
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether the current mount was made by this handle.
    pub fn is_managed(&self) -> bool {
        self.shared.managed.load(Ordering::Acquire)
    }

    pub fn is_removed(&self) -> bool {
        self.shared.removed.load(Ordering::Acquire)
    }

    /// Result of the last completed mount or unmount.
    pub fn last_result(&self) -> Option<Result<(), MountError>> {
        self.shared
            .last_result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn exclusive_access(&self) -> bool {
        match &self.shared.role {
            Role::Destination { exclusive_access } => exclusive_access.load(Ordering::Acquire),
            Role::Source { .. } => false,
        }
    }

    /// Only meaningful on destinations; ignored on sources.
    pub fn set_exclusive_access(&self, enabled: bool) {
        if let Role::Destination { exclusive_access } = &self.shared.role {
            exclusive_access.store(enabled, Ordering::Release);
        }
    }

    /// Base system location on a mounted source.
    pub fn base_system_path(&self) -> Option<PathBuf> {
        self.source_paths().map(|p| p.base_system)
    }

    /// Install payload location on a mounted source.
    pub fn install_payload_path(&self) -> Option<PathBuf> {
        self.source_paths().map(|p| p.install_payload)
    }

    fn source_paths(&self) -> Option<SourcePaths> {
        match &self.shared.role {
            Role::Source { paths, .. } => paths.read().unwrap_or_else(|p| p.into_inner()).clone(),
            Role::Destination { .. } => None,
        }
    }

    fn populate_source_paths(&self, mountpoint: &Path) {
        if let Role::Source { layout, paths } = &self.shared.role {
            *paths.write().unwrap_or_else(|p| p.into_inner()) = Some(SourcePaths {
                base_system: mountpoint.join(&layout.base_system),
                install_payload: mountpoint.join(&layout.install_payload),
            });
        }
    }

    fn clear_source_paths(&self) {
        if let Role::Source { paths, .. } = &self.shared.role {
            *paths.write().unwrap_or_else(|p| p.into_inner()) = None;
        }
    }

    /// Refresh descriptive attributes from a repeated arrival.
    pub fn update(&self, device: &BlockDevice) {
        let mut info = self.shared.info.write().unwrap_or_else(|p| p.into_inner());
        let mountpoint = if self.is_managed() {
            info.mountpoint.clone()
        } else {
            device.mount_point.clone()
        };
        *info = VolumeInfo {
            mountpoint,
            ..info_from_device(device)
        };
        drop(info);

        *self
            .shared
            .criteria
            .write()
            .unwrap_or_else(|p| p.into_inner()) = device.criteria.clone();
        *self
            .shared
            .backing_file
            .write()
            .unwrap_or_else(|p| p.into_inner()) = device.backing_file.clone();

        if let Some(mountpoint) = &device.mount_point {
            if !self.is_managed() {
                self.populate_source_paths(mountpoint);
            }
        }
    }

    /// Mountpoint used when the arbiter does not choose one.
    pub fn default_mountpoint(&self) -> PathBuf {
        let info = self.info();
        let name = sanitize(&info.label);
        let name = if name.is_empty() { sanitize(&info.id) } else { name };
        self.shared
            .options
            .mount_base
            .join(format!("{}-{}", name, sanitize(&info.id)))
    }

    /// Mount the volume and block until the arbiter has answered.
    ///
    /// Sources are mounted read-only. Returns the mountpoint. A volume that
    /// is already mounted is left as is.
    pub fn mount(&self) -> Result<PathBuf, MountError> {
        let _gate = self.gate();
        self.ensure_present()?;

        if let Some(existing) = self.mountpoint() {
            debug!(device = %self.id(), mountpoint = %existing.display(), "Already mounted");
            self.populate_source_paths(&existing);
            self.record(Ok(()));
            return Ok(existing);
        }

        let info = self.info();
        let requested = self.default_mountpoint();
        let request = MountRequest {
            criteria: self.criteria(),
            mountpoint: requested.clone(),
            filesystem: info.filesystem,
            read_only: self.kind() == VolumeKind::Source,
        };

        info!(device = %self.id(), mountpoint = %requested.display(), "Mounting volume");
        let arbiter = self.shared.arbiter.clone();
        let outcome = self.perform(move |completion| arbiter.mount(request, completion));

        match outcome {
            Ok(actual) => {
                let mountpoint = actual.unwrap_or(requested);
                self.set_mountpoint(Some(mountpoint.clone()));
                self.shared.managed.store(true, Ordering::Release);
                self.populate_source_paths(&mountpoint);
                self.record(Ok(()));
                info!(device = %self.id(), mountpoint = %mountpoint.display(), "Volume mounted");
                Ok(mountpoint)
            }
            Err(e) => {
                warn!(device = %self.id(), error = %e, "Mount failed");
                self.record(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Unmount the volume and block until the arbiter has answered.
    ///
    /// With exclusive access set, open references below the mountpoint are
    /// inspected first: read-only holders are detached with a forced unmount,
    /// any writer makes the call fail without touching the mount.
    pub fn unmount(&self) -> Result<(), MountError> {
        let _gate = self.gate();
        self.ensure_present()?;

        let Some(mountpoint) = self.mountpoint() else {
            let err = MountError::NotMounted {
                device: self.id().to_string(),
            };
            self.record(Err(err.clone()));
            return Err(err);
        };

        let mut force = false;
        if self.exclusive_access() {
            let holders = self.open_references_at(&mountpoint)?;
            if holders.iter().any(|h| h.writable) {
                let err = MountError::from(ExclusiveAccessError {
                    device: self.id().to_string(),
                    holders,
                });
                warn!(device = %self.id(), error = %err, "Refusing to force unmount");
                self.record(Err(err.clone()));
                return Err(err);
            }
            force = !holders.is_empty();
        }

        let request = UnmountRequest {
            criteria: self.criteria(),
            mountpoint: mountpoint.clone(),
            force,
        };

        info!(device = %self.id(), mountpoint = %mountpoint.display(), force, "Unmounting volume");
        let arbiter = self.shared.arbiter.clone();
        let outcome = self.perform(move |completion| arbiter.unmount(request, completion));

        match outcome {
            Ok(_) => {
                self.set_mountpoint(None);
                self.shared.managed.store(false, Ordering::Release);
                self.clear_source_paths();
                self.record(Ok(()));
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.id(), error = %e, "Unmount failed");
                self.record(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Processes holding files open on the mounted volume.
    pub fn open_references(&self) -> Result<Vec<OpenReference>, MountError> {
        match self.mountpoint() {
            Some(mountpoint) => self.open_references_at(&mountpoint),
            None => Ok(Vec::new()),
        }
    }

    /// Fail if anything other than this tool holds the volume open.
    pub fn ensure_exclusive(&self) -> Result<(), MountError> {
        let holders = self.open_references()?;
        if holders.is_empty() {
            return Ok(());
        }
        Err(ExclusiveAccessError {
            device: self.id().to_string(),
            holders,
        }
        .into())
    }

    /// Release the handle after its device has gone away. Any in-flight
    /// mount or unmount resolves with [`MountError::Vanished`]. Mount state
    /// is left untouched. Calling this more than once is harmless.
    pub fn remove(&self) {
        if self.shared.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(device = %self.id(), "Removing volume handle");
        if let Some(armed) = self.shared.pending().take() {
            let _ = armed.tx.try_send(Err(MountError::Vanished {
                device: self.id().to_string(),
            }));
        }
    }

    fn open_references_at(&self, mountpoint: &Path) -> Result<Vec<OpenReference>, MountError> {
        self.shared
            .arbiter
            .open_references(mountpoint)
            .map_err(|e| MountError::Dissented {
                device: self.id().to_string(),
                dissent: Dissent::new(libc::EIO, format!("{:#}", e)),
            })
    }

    fn perform<F>(&self, issue: F) -> Outcome
    where
        F: FnOnce(Completion),
    {
        let op = self.shared.next_op.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = mpsc::sync_channel(1);
        *self.shared.pending() = Some(Pending { op, tx });

        // A removal racing with arming must still release this call.
        if self.is_removed() {
            self.disarm(op);
            return Err(MountError::Vanished {
                device: self.id().to_string(),
            });
        }

        issue(Completion {
            op,
            device: self.id().to_string(),
            target: Arc::downgrade(&self.shared),
            done: false,
        });

        let timeout = self.shared.options.timeout;
        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.disarm(op);
                match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                        Err(MountError::TimedOut {
                            device: self.id().to_string(),
                            timeout,
                        })
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(MountError::Vanished {
                device: self.id().to_string(),
            }),
        }
    }

    fn disarm(&self, op: OperationId) {
        let mut pending = self.shared.pending();
        if pending.as_ref().is_some_and(|armed| armed.op == op) {
            pending.take();
        }
    }

    fn ensure_present(&self) -> Result<(), MountError> {
        if self.is_removed() {
            let err = MountError::Removed {
                device: self.id().to_string(),
            };
            self.record(Err(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.shared.gate.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_mountpoint(&self, mountpoint: Option<PathBuf>) {
        self.shared
            .info
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .mountpoint = mountpoint;
    }

    fn record(&self, result: Result<(), MountError>) {
        *self
            .shared
            .last_result
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(result);
    }
}

fn info_from_device(device: &BlockDevice) -> VolumeInfo {
    VolumeInfo {
        id: device.id.clone(),
        label: device.label.clone(),
        details: device.details.clone(),
        icon: device.icon.clone(),
        size: device.capacity,
        filesystem: device.filesystem.clone(),
        devnode: device.devnode.clone(),
        mountpoint: device.mount_point.clone(),
    }
}

fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
