//! Error taxonomy shared by the volume layer, the process engine and the
//! transfer coordinator.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::process::Termination;

/// Code and description reported by the device arbiter when it refuses or
/// fails an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dissent {
    pub code: i32,
    pub description: String,
}

impl Dissent {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Build a dissent from an errno value returned by a mount syscall.
    pub fn from_errno(errno: nix::errno::Errno) -> Self {
        Self::new(errno as i32, errno.desc())
    }
}

impl fmt::Display for Dissent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.description, self.code)
    }
}

/// A process holding files open below a mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReference {
    pub pid: i32,
    pub command: String,
    pub writable: bool,
}

impl fmt::Display for OpenReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.writable { "rw" } else { "ro" };
        write!(f, "{} (pid {}, {})", self.command, self.pid, mode)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{device} is held open by {}", format_holders(.holders))]
pub struct ExclusiveAccessError {
    pub device: String,
    pub holders: Vec<OpenReference>,
}

fn format_holders(holders: &[OpenReference]) -> String {
    holders
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MountError {
    #[error("{device}: {dissent}")]
    Dissented { device: String, dissent: Dissent },

    #[error("{device} disappeared while the operation was in flight")]
    Vanished { device: String },

    #[error("{device} did not answer within {}s", .timeout.as_secs())]
    TimedOut { device: String, timeout: Duration },

    #[error("{device} has been removed")]
    Removed { device: String },

    #[error("{device} is not mounted")]
    NotMounted { device: String },

    #[error(transparent)]
    ExclusiveAccess(#[from] ExclusiveAccessError),
}

impl MountError {
    /// Code and description suitable for display, whatever the variant.
    pub fn dissent(&self) -> Dissent {
        match self {
            Self::Dissented { dissent, .. } => dissent.clone(),
            Self::Vanished { .. } | Self::Removed { .. } => {
                Dissent::new(libc::ENODEV, self.to_string())
            }
            Self::TimedOut { .. } => Dissent::new(libc::ETIMEDOUT, self.to_string()),
            Self::NotMounted { .. } => Dissent::new(libc::EINVAL, self.to_string()),
            Self::ExclusiveAccess(_) => Dissent::new(libc::EBUSY, self.to_string()),
        }
    }

    pub fn device(&self) -> &str {
        match self {
            Self::Dissented { device, .. }
            | Self::Vanished { device }
            | Self::TimedOut { device, .. }
            | Self::Removed { device }
            | Self::NotMounted { device } => device,
            Self::ExclusiveAccess(e) => &e.device,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("executable not permitted: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("working directory is not a directory: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    #[error("process has already been launched")]
    AlreadyLaunched,

    #[error("no async runtime available to supervise the process")]
    NoRuntime,

    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{} {termination}", .program.display())]
pub struct ProcessFailure {
    pub program: PathBuf,
    pub termination: Termination,
    /// Everything the process wrote to stdout, then stderr.
    pub output: String,
}

impl ProcessFailure {
    /// The last few lines of captured output, for display.
    pub fn excerpt(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transfer cancelled")]
pub struct CancelledError;

/// Reason carried by a failed transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("mount failed: {0}")]
    Mount(#[from] MountError),

    #[error("launch failed in step '{step}': {source}")]
    Launch {
        step: String,
        #[source]
        source: LaunchError,
    },

    #[error("step '{step}' failed: {source}")]
    Process {
        step: String,
        #[source]
        source: ProcessFailure,
    },

    #[error(transparent)]
    ExclusiveAccess(#[from] ExclusiveAccessError),

    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    #[error("source volume has no {0} path")]
    MissingSourcePath(&'static str),
}
