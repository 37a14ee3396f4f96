use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::core::hardware::DiskArbiter;
use crate::core::registry::VolumeRegistry;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxArbiter, LinuxArbiterConfig};
pub use simulated::{SimulatedArbiter, SimulatedOp, Simulator};

/// Pick the arbiter for this run. The simulator controller is returned when
/// simulating so callers can plug devices in.
pub fn get_arbiter(config: &AppConfig) -> Result<(Arc<dyn DiskArbiter>, Option<Simulator>)> {
    if config.simulation {
        let (arbiter, controller) = SimulatedArbiter::new();
        return Ok((Arc::new(arbiter), Some(controller)));
    }

    #[cfg(target_os = "linux")]
    {
        Ok((Arc::new(LinuxArbiter::new(LinuxArbiterConfig::default())), None))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("No disk arbiter for this platform; use --simulation")
    }
}

pub const DEMO_IMAGE_ID: &str = "sim-installer";
pub const DEMO_DISK_ID: &str = "sim-usb";

/// Populate a simulator with one installer image and one 16 GB removable
/// disk. The image is a directory under `mount_base` holding the source
/// layout with a few placeholder files.
pub fn seed_simulation(
    simulator: &Simulator,
    registry: &VolumeRegistry,
    config: &AppConfig,
) -> Result<PathBuf> {
    let image = config.mount_base.join("simulation").join("Demo Installer");
    let layout = &config.source_layout;

    write_file(&image.join(&layout.base_system).join("kernel"), b"simulated kernel\n")?;
    write_file(
        &image.join(&layout.base_system).join("etc/release"),
        b"Demo Installer 1.0\n",
    )?;
    write_file(
        &image.join(&layout.install_payload).join("base.pkg"),
        b"simulated payload\n",
    )?;

    registry.register_image(&image);
    simulator.add_image(DEMO_IMAGE_ID, &image);
    simulator.add_device(DEMO_DISK_ID, 16);

    info!(image = %image.display(), "Seeded simulated devices");
    Ok(image)
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}
