use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::hardware::{
    BlockDevice, DiskArbiter, HardwareEvent, MatchCriteria, MountRequest, SupportedFilesystem,
    UnmountRequest,
};
use crate::core::volume::Completion;
use crate::error::{Dissent, OpenReference};

#[derive(Debug, Clone)]
pub struct LinuxArbiterConfig {
    /// Root of the proc filesystem, for mount and open file lookups.
    pub proc_root: PathBuf,
    /// How long the monitor blocks in poll before checking for shutdown.
    pub poll_timeout: Duration,
}

impl Default for LinuxArbiterConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            poll_timeout: Duration::from_millis(500),
        }
    }
}

/// Disk arbiter backed by udev for discovery and mount(2) for mounting.
pub struct LinuxArbiter {
    config: LinuxArbiterConfig,
    shutdown: CancellationToken,
}

impl LinuxArbiter {
    pub fn new(config: LinuxArbiterConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LinuxArbiterConfig::default())
    }
}

impl DiskArbiter for LinuxArbiter {
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>) {
        let shutdown = self.shutdown.clone();
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("udev-monitor".to_string())
            .spawn(move || {
                info!("Starting udev monitor");
                if let Err(e) = monitor(&config, &event_sender, &shutdown) {
                    error!(error = %e, "udev monitor failed");
                }
                debug!("udev monitor stopped");
            });

        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn udev monitor thread");
        }
    }

    fn stop(&self) {
        self.shutdown.cancel();
    }

    fn list_devices(&self) -> Result<Vec<BlockDevice>> {
        let mounts = read_mounts(&self.config.proc_root);

        let mut enumerator = udev::Enumerator::new().context("Failed to create udev enumerator")?;
        enumerator
            .match_subsystem("block")
            .context("Failed to filter udev enumerator")?;

        let devices = enumerator
            .scan_devices()
            .context("Failed to enumerate block devices")?
            .filter_map(|device| block_device(&device, &mounts))
            .collect();
        Ok(devices)
    }

    fn mount(&self, request: MountRequest, completion: Completion) {
        let proc_root = self.config.proc_root.clone();
        spawn_operation("mount", completion, move || {
            let devnode = resolve(&request.criteria, &proc_root)?;
            do_mount(&devnode, &request)
        });
    }

    fn unmount(&self, request: UnmountRequest, completion: Completion) {
        spawn_operation("unmount", completion, move || do_unmount(&request));
    }

    fn open_references(&self, mountpoint: &Path) -> Result<Vec<OpenReference>> {
        scan_open_references(&self.config.proc_root, mountpoint)
    }
}

fn monitor(
    config: &LinuxArbiterConfig,
    tx: &mpsc::Sender<HardwareEvent>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let socket = udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem("block"))
        .and_then(|b| b.listen())
        .context("Failed to open udev monitor")?;

    let millis = u16::try_from(config.poll_timeout.as_millis()).unwrap_or(u16::MAX);
    let timeout = PollTimeout::from(millis);

    while !shutdown.is_cancelled() {
        let ready = {
            let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(e).context("poll on udev socket failed"),
            }
        };
        if !ready {
            continue;
        }

        for event in socket.iter() {
            let device = event.device();
            let hardware_event = match event.event_type() {
                udev::EventType::Add | udev::EventType::Change => {
                    let mounts = read_mounts(&config.proc_root);
                    match block_device(&device, &mounts) {
                        Some(found) => HardwareEvent::DeviceAdded(found),
                        None => continue,
                    }
                }
                udev::EventType::Remove => {
                    HardwareEvent::DeviceRemoved(lossy(device.sysname()))
                }
                _ => continue,
            };

            debug!(event = ?hardware_event, "udev event");
            if tx.blocking_send(hardware_event).is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Build a [`BlockDevice`] from a udev device, or `None` if it carries no
/// filesystem.
fn block_device(device: &udev::Device, mounts: &[MountEntry]) -> Option<BlockDevice> {
    let filesystem = device.property_value("ID_FS_TYPE").map(lossy)?;
    if filesystem.is_empty() {
        return None;
    }
    let devnode = device.devnode()?.to_path_buf();
    let id = lossy(device.sysname());

    let disk = if device.devtype() == Some(OsStr::new("partition")) {
        device.parent()
    } else {
        None
    };
    let whole = disk.as_ref().unwrap_or(device);

    let capacity = device
        .attribute_value("size")
        .and_then(|s| s.to_str()?.trim().parse::<u64>().ok())
        .unwrap_or(0)
        .saturating_mul(512);

    let removable = whole
        .attribute_value("removable")
        .is_some_and(|v| v == OsStr::new("1"))
        || device.property_value("ID_BUS") == Some(OsStr::new("usb"));

    let backing_file = fs::read_to_string(whole.syspath().join("loop/backing_file"))
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty());

    let label = device
        .property_value("ID_FS_LABEL")
        .or_else(|| device.property_value("ID_MODEL"))
        .map(lossy)
        .unwrap_or_else(|| id.clone());

    let details = match &backing_file {
        Some(file) => format!("Disk image {}", file.display()),
        None => [
            device.property_value("ID_VENDOR"),
            device.property_value("ID_MODEL"),
        ]
        .into_iter()
        .flatten()
        .map(lossy)
        .collect::<Vec<_>>()
        .join(" "),
    };

    let icon = if backing_file.is_some() || filesystem == "iso9660" {
        "media-optical"
    } else if removable {
        "drive-removable-media"
    } else {
        "drive-harddisk"
    };

    let mount_point = mounts
        .iter()
        .find(|m| m.source == devnode)
        .map(|m| m.target.clone());

    Some(BlockDevice {
        id,
        criteria: MatchCriteria {
            uuid: device.property_value("ID_FS_UUID").map(lossy),
            devnode: Some(devnode.clone()),
        },
        devnode,
        label,
        details,
        icon: icon.to_string(),
        capacity,
        filesystem,
        removable,
        backing_file,
        mount_point,
    })
}

fn lossy(s: &OsStr) -> String {
    s.to_string_lossy().into_owned()
}

/// Run a blocking mount operation off the caller's thread and deliver its
/// result. A failed spawn drops the completion, which reports the device as
/// vanished.
fn spawn_operation<F>(name: &'static str, completion: Completion, work: F)
where
    F: FnOnce() -> Result<Option<PathBuf>, Dissent> + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("arbiter-{}", name))
        .spawn(move || {
            let result = work();
            if let Err(dissent) = &result {
                debug!(device = %completion.device(), operation = name, %dissent, "Arbiter dissented");
            }
            completion.complete(result);
        });

    if let Err(e) = spawned {
        error!(operation = name, error = %e, "Failed to spawn arbiter thread");
    }
}

fn resolve(criteria: &MatchCriteria, proc_root: &Path) -> Result<PathBuf, Dissent> {
    let arbiter = LinuxArbiter::new(LinuxArbiterConfig {
        proc_root: proc_root.to_path_buf(),
        ..LinuxArbiterConfig::default()
    });
    let devices = arbiter
        .list_devices()
        .map_err(|e| Dissent::new(libc::EIO, format!("{:#}", e)))?;

    devices
        .into_iter()
        .find(|d| criteria.matches(d))
        .map(|d| d.devnode)
        .ok_or_else(|| Dissent::new(libc::ENODEV, format!("no disk matches {}", criteria)))
}

fn do_mount(devnode: &Path, request: &MountRequest) -> Result<Option<PathBuf>, Dissent> {
    fs::create_dir_all(&request.mountpoint)
        .map_err(|e| Dissent::new(e.raw_os_error().unwrap_or(libc::EIO), e.to_string()))?;

    let fstype = SupportedFilesystem::parse(&request.filesystem)
        .map(|fs| fs.as_str().to_string())
        .unwrap_or_else(|| request.filesystem.clone());

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if request.read_only {
        flags |= MsFlags::MS_RDONLY;
    }

    info!(
        device = %devnode.display(),
        mountpoint = %request.mountpoint.display(),
        fstype = %fstype,
        read_only = request.read_only,
        "mount(2)"
    );

    if let Err(errno) = nix::mount::mount(
        Some(devnode),
        &request.mountpoint,
        Some(fstype.as_str()),
        flags,
        None::<&str>,
    ) {
        let _ = fs::remove_dir(&request.mountpoint);
        return Err(Dissent::from_errno(errno));
    }
    Ok(Some(request.mountpoint.clone()))
}

fn do_unmount(request: &UnmountRequest) -> Result<Option<PathBuf>, Dissent> {
    let flags = if request.force {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };

    info!(mountpoint = %request.mountpoint.display(), force = request.force, "umount2(2)");
    nix::mount::umount2(&request.mountpoint, flags).map_err(Dissent::from_errno)?;

    if let Err(e) = fs::remove_dir(&request.mountpoint) {
        warn!(mountpoint = %request.mountpoint.display(), error = %e, "Could not remove mountpoint");
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    source: PathBuf,
    target: PathBuf,
}

fn read_mounts(proc_root: &Path) -> Vec<MountEntry> {
    match fs::read_to_string(proc_root.join("self/mounts")) {
        Ok(content) => parse_mounts(&content),
        Err(e) => {
            warn!(error = %e, "Failed to read mount table");
            Vec::new()
        }
    }
}

/// Parse `/proc/self/mounts`: `source target fstype options freq passno`.
fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some(MountEntry {
                source: PathBuf::from(unescape(source)),
                target: PathBuf::from(unescape(target)),
            })
        })
        .collect()
}

/// Undo the kernel's octal escaping of spaces, tabs, newlines and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Processes with a file or working directory below `mountpoint`, found by
/// walking `<proc_root>/<pid>/fd`. Processes we cannot inspect are skipped.
fn scan_open_references(proc_root: &Path, mountpoint: &Path) -> Result<Vec<OpenReference>> {
    let own_pid = std::process::id() as i32;
    let mut holders: BTreeMap<i32, OpenReference> = BTreeMap::new();

    let entries = fs::read_dir(proc_root)
        .with_context(|| format!("Failed to read {}", proc_root.display()))?;

    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let process = entry.path();

        let mut found = false;
        let mut writable = false;

        if let Ok(fds) = fs::read_dir(process.join("fd")) {
            for fd in fds.filter_map(|e| e.ok()) {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };
                if !target.starts_with(mountpoint) {
                    continue;
                }
                found = true;
                let flags = fs::read_to_string(process.join("fdinfo").join(fd.file_name()))
                    .ok()
                    .and_then(|info| parse_fdinfo_flags(&info));
                if flags.is_some_and(|f| f & libc::O_ACCMODE != libc::O_RDONLY) {
                    writable = true;
                }
            }
        }

        if fs::read_link(process.join("cwd")).is_ok_and(|cwd| cwd.starts_with(mountpoint)) {
            found = true;
        }

        if found {
            let command = fs::read_to_string(process.join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "?".to_string());
            holders.insert(
                pid,
                OpenReference {
                    pid,
                    command,
                    writable,
                },
            );
        }
    }

    Ok(holders.into_values().collect())
}

/// The octal `flags:` field of an fdinfo file.
fn parse_fdinfo_flags(info: &str) -> Option<i32> {
    info.lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|value| i32::from_str_radix(value.trim(), 8).ok())
}
