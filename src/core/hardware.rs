use std::fmt;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::core::volume::Completion;
use crate::error::OpenReference;

#[derive(Debug, Clone)]
pub enum HardwareEvent {
    DeviceAdded(BlockDevice),
    DeviceRemoved(String),
}

/// Criteria used to find a device again in the OS device registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchCriteria {
    pub uuid: Option<String>,
    pub devnode: Option<PathBuf>,
}

impl MatchCriteria {
    pub fn matches(&self, device: &BlockDevice) -> bool {
        if self.uuid.is_none() && self.devnode.is_none() {
            return false;
        }
        let uuid_ok = match &self.uuid {
            Some(uuid) => device.criteria.uuid.as_deref() == Some(uuid.as_str()),
            None => true,
        };
        let node_ok = match &self.devnode {
            Some(node) => device.devnode == *node,
            None => true,
        };
        uuid_ok && node_ok
    }
}

impl fmt::Display for MatchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uuid, &self.devnode) {
            (Some(uuid), Some(node)) => write!(f, "uuid={} node={}", uuid, node.display()),
            (Some(uuid), None) => write!(f, "uuid={}", uuid),
            (None, Some(node)) => write!(f, "node={}", node.display()),
            (None, None) => write!(f, "<empty>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    /// Kernel name of the device (e.g. `sdb1`), stable while attached.
    pub id: String,
    pub criteria: MatchCriteria,
    pub devnode: PathBuf,
    pub label: String,
    pub details: String,
    pub icon: String,
    pub capacity: u64,
    pub filesystem: String,
    pub removable: bool,
    /// Image file backing a loop device.
    pub backing_file: Option<PathBuf>,
    /// Where the OS already has the device mounted, if anywhere.
    pub mount_point: Option<PathBuf>,
}

/// Filesystems the tool knows how to mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFilesystem {
    Ext4,
    Exfat,
    Vfat,
    Ntfs,
    Btrfs,
    Iso9660,
    Udf,
    Hfsplus,
}

impl SupportedFilesystem {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ext4" => Some(Self::Ext4),
            "exfat" => Some(Self::Exfat),
            "vfat" | "fat32" | "fat16" => Some(Self::Vfat),
            "ntfs" | "ntfs3" => Some(Self::Ntfs),
            "btrfs" => Some(Self::Btrfs),
            "iso9660" => Some(Self::Iso9660),
            "udf" => Some(Self::Udf),
            "hfsplus" => Some(Self::Hfsplus),
            _ => None,
        }
    }

    /// Name passed to mount(2).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Exfat => "exfat",
            Self::Vfat => "vfat",
            Self::Ntfs => "ntfs3",
            Self::Btrfs => "btrfs",
            Self::Iso9660 => "iso9660",
            Self::Udf => "udf",
            Self::Hfsplus => "hfsplus",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountRequest {
    pub criteria: MatchCriteria,
    pub mountpoint: PathBuf,
    pub filesystem: String,
    pub read_only: bool,
}

#[derive(Debug, Clone)]
pub struct UnmountRequest {
    pub criteria: MatchCriteria,
    pub mountpoint: PathBuf,
    /// Detach even when the filesystem is busy.
    pub force: bool,
}

/// The OS device-arbitration service.
///
/// Mount and unmount are asynchronous: implementations return immediately and
/// later resolve the supplied [`Completion`] from a context of their choosing.
/// Dropping a completion without resolving it reports the device as vanished.
pub trait DiskArbiter: Send + Sync {
    /// Start listening for hardware events.
    /// Spawns internal tasks that send events to the provided channel.
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>);

    /// Stop the hardware monitor gracefully.
    fn stop(&self);

    /// List all currently connected devices carrying a filesystem.
    fn list_devices(&self) -> anyhow::Result<Vec<BlockDevice>>;

    fn mount(&self, request: MountRequest, completion: Completion);

    fn unmount(&self, request: UnmountRequest, completion: Completion);

    /// Processes holding files open below `mountpoint`.
    fn open_references(&self, mountpoint: &Path) -> anyhow::Result<Vec<OpenReference>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(uuid: Option<&str>, node: &str) -> BlockDevice {
        BlockDevice {
            id: "sdb1".to_string(),
            criteria: MatchCriteria {
                uuid: uuid.map(str::to_string),
                devnode: Some(PathBuf::from(node)),
            },
            devnode: PathBuf::from(node),
            label: "USB".to_string(),
            details: String::new(),
            icon: "drive-removable-media".to_string(),
            capacity: 0,
            filesystem: "vfat".to_string(),
            removable: true,
            backing_file: None,
            mount_point: None,
        }
    }

    #[test]
    fn test_criteria_match_by_uuid_and_node() {
        let dev = device(Some("ABCD-1234"), "/dev/sdb1");

        let by_uuid = MatchCriteria {
            uuid: Some("ABCD-1234".to_string()),
            devnode: None,
        };
        assert!(by_uuid.matches(&dev));

        let wrong_node = MatchCriteria {
            uuid: Some("ABCD-1234".to_string()),
            devnode: Some(PathBuf::from("/dev/sdc1")),
        };
        assert!(!wrong_node.matches(&dev));
    }

    #[test]
    fn test_empty_criteria_never_match() {
        let dev = device(None, "/dev/sdb1");
        assert!(!MatchCriteria::default().matches(&dev));
    }

    #[test]
    fn test_supported_filesystem_parse() {
        assert_eq!(SupportedFilesystem::parse("FAT32"), Some(SupportedFilesystem::Vfat));
        assert_eq!(SupportedFilesystem::parse("ntfs").map(|f| f.as_str()), Some("ntfs3"));
        assert_eq!(SupportedFilesystem::parse("zfs"), None);
    }
}
