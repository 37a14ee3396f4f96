pub mod coordinator;
pub mod hardware;
pub mod installer;
pub mod plan;
pub mod process;
pub mod progress;
pub mod registry;
pub mod volume;

pub use coordinator::{
    CancelHandle, Confirm, ConfirmationPrompt, TransferCoordinator, TransferOutcome,
    TransferReport, TransferState,
};
pub use hardware::{BlockDevice, DiskArbiter, HardwareEvent, MatchCriteria};
pub use installer::InstallerImage;
pub use plan::{ProgressFormat, StepSpec, TransferPlan};
pub use process::{ProcessSession, SessionState, Termination, TerminationReason};
pub use progress::{ChannelObserver, NullObserver, Progress, TransferEvent, TransferObserver};
pub use registry::{DeviceFilter, RegistryEvent, RegistryOptions, VolumeRegistry};
pub use volume::{Completion, SourceLayout, VolumeHandle, VolumeKind, VolumeOptions, VolumeRole};
