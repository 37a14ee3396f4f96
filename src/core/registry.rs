//! The authoritative list of volumes the user can pick from.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::hardware::{BlockDevice, DiskArbiter, HardwareEvent, UnmountRequest};
use crate::core::volume::{Completion, SourceLayout, VolumeHandle, VolumeKind, VolumeOptions, VolumeRole};

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    VolumeAdded(VolumeHandle),
    /// A repeated arrival refreshed an existing handle.
    VolumeChanged(VolumeHandle),
    VolumeRemoved(String),
}

/// Which devices are offered as destinations.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub removable_only: bool,
    pub min_size: u64,
    /// Offer every loop-backed image as a source, not only the ones this
    /// application attached.
    pub any_disk_image: bool,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            removable_only: true,
            min_size: 8 * 1024 * 1024 * 1024,
            any_disk_image: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    pub filter: DeviceFilter,
    pub volume: VolumeOptions,
    pub source_layout: SourceLayout,
}

pub struct VolumeRegistry {
    arbiter: Arc<dyn DiskArbiter>,
    options: RegistryOptions,
    volumes: RwLock<Vec<VolumeHandle>>,
    attached_images: RwLock<HashSet<PathBuf>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl VolumeRegistry {
    pub fn new(arbiter: Arc<dyn DiskArbiter>, options: RegistryOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            arbiter,
            options,
            volumes: RwLock::new(Vec::new()),
            attached_images: RwLock::new(HashSet::new()),
            events,
        }
    }

    pub fn arbiter(&self) -> Arc<dyn DiskArbiter> {
        self.arbiter.clone()
    }

    /// Observe additions and removals in the order they are applied.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Remember an image this application attached so that its loop device
    /// is offered as a source.
    pub fn register_image(&self, path: &Path) {
        let path = canonical(path);
        debug!(image = %path.display(), "Registering attached image");
        self.attached_images
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path);
    }

    pub fn forget_image(&self, path: &Path) {
        self.attached_images
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&canonical(path));
    }

    /// Enumerate currently attached devices and treat each as an arrival.
    /// Returns the number of volumes known afterwards.
    pub fn scan(&self) -> anyhow::Result<usize> {
        let devices = self.arbiter.list_devices()?;
        debug!(count = devices.len(), "Scanned devices");
        for device in devices {
            self.device_added(device);
        }
        Ok(self.len())
    }

    /// Start the arbiter and apply its events until it stops.
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(32);
        self.arbiter.start(tx);
        let registry = self.clone();
        tokio::spawn(async move { registry.run(rx).await })
    }

    pub async fn run(&self, mut rx: mpsc::Receiver<HardwareEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        debug!("Hardware event stream closed");
    }

    pub fn handle_event(&self, event: HardwareEvent) {
        match event {
            HardwareEvent::DeviceAdded(device) => self.device_added(device),
            HardwareEvent::DeviceRemoved(id) => self.device_removed(&id),
        }
    }

    fn device_added(&self, device: BlockDevice) {
        let mut volumes = self.volumes.write().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = volumes.iter().find(|v| v.id() == device.id) {
            debug!(device = %device.id, "Duplicate arrival, updating in place");
            existing.update(&device);
            let _ = self.events.send(RegistryEvent::VolumeChanged(existing.clone()));
            return;
        }

        let Some(role) = self.classify(&device) else {
            debug!(
                device = %device.id,
                capacity = device.capacity,
                removable = device.removable,
                "Ignoring device"
            );
            return;
        };

        let handle = VolumeHandle::new(
            &device,
            role,
            self.arbiter.clone(),
            self.options.volume.clone(),
        );
        info!(
            device = %device.id,
            label = %device.label,
            kind = ?handle.kind(),
            "Volume added"
        );
        volumes.push(handle.clone());
        let _ = self.events.send(RegistryEvent::VolumeAdded(handle));
    }

    fn device_removed(&self, id: &str) {
        let handle = {
            let mut volumes = self.volumes.write().unwrap_or_else(|p| p.into_inner());
            let Some(index) = volumes.iter().position(|v| v.id() == id) else {
                debug!(device = %id, "Removal for unknown device");
                return;
            };
            let handle = volumes.remove(index);
            handle.remove();
            info!(device = %id, "Volume removed");
            let _ = self.events.send(RegistryEvent::VolumeRemoved(id.to_string()));
            handle
        };

        if handle.is_managed() {
            if let Some(mountpoint) = handle.mountpoint() {
                warn!(
                    device = %id,
                    mountpoint = %mountpoint.display(),
                    "Device removed while mounted, detaching"
                );
                self.arbiter.unmount(
                    UnmountRequest {
                        criteria: handle.criteria(),
                        mountpoint,
                        force: true,
                    },
                    Completion::detached(id),
                );
            }
        }
    }

    fn classify(&self, device: &BlockDevice) -> Option<VolumeRole> {
        let filter = &self.options.filter;

        if let Some(backing) = &device.backing_file {
            let attached = self
                .attached_images
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .contains(&canonical(backing));
            if attached || filter.any_disk_image {
                return Some(VolumeRole::Source(self.options.source_layout.clone()));
            }
            return None;
        }

        if filter.removable_only && !device.removable {
            return None;
        }
        if device.capacity < filter.min_size {
            return None;
        }
        Some(VolumeRole::Destination {
            exclusive_access: false,
        })
    }

    /// All volumes in arrival order.
    pub fn volumes(&self) -> Vec<VolumeHandle> {
        self.volumes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<VolumeHandle> {
        self.volumes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|v| v.id() == id)
            .cloned()
    }

    pub fn sources(&self) -> Vec<VolumeHandle> {
        self.of_kind(VolumeKind::Source)
    }

    pub fn destinations(&self) -> Vec<VolumeHandle> {
        self.of_kind(VolumeKind::Destination)
    }

    /// Source volume backed by `image`, if its loop device has arrived.
    pub fn source_for_image(&self, image: &Path) -> Option<VolumeHandle> {
        let image = canonical(image);
        self.sources()
            .into_iter()
            .find(|v| v.backing_file().is_some_and(|b| canonical(&b) == image))
    }

    pub fn len(&self) -> usize {
        self.volumes.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn of_kind(&self, kind: VolumeKind) -> Vec<VolumeHandle> {
        self.volumes()
            .into_iter()
            .filter(|v| v.kind() == kind)
            .collect()
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
