use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::plan::{StepSpec, TransferPlan};
use crate::core::registry::{DeviceFilter, RegistryOptions};
use crate::core::volume::{SourceLayout, VolumeOptions};

pub const CONFIG_PATH: &str = "/etc/xrecovery/config.toml";
pub const ENV_PREFIX: &str = "XRECOVERY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory under which volumes are mounted.
    pub mount_base: PathBuf,
    pub mount_timeout_secs: u64,
    /// Smallest destination offered, in bytes.
    pub min_device_size: u64,
    pub removable_only: bool,
    /// Offer every loop-backed image as a source.
    pub any_disk_image: bool,
    /// Refuse to write to a destination other processes hold open.
    pub exclusive_access: bool,
    pub installer_dirs: Vec<PathBuf>,
    /// Extra directories copied onto the destination after the main steps.
    pub additions: Vec<PathBuf>,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub source_layout: SourceLayout,
    pub steps: Vec<StepSpec>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let registry = DeviceFilter::default();
        let volume = VolumeOptions::default();
        Self {
            mount_base: volume.mount_base,
            mount_timeout_secs: volume.timeout.as_secs(),
            min_device_size: registry.min_size,
            removable_only: registry.removable_only,
            any_disk_image: registry.any_disk_image,
            exclusive_access: false,
            installer_dirs: vec![PathBuf::from("/var/lib/xrecovery/installers")],
            additions: Vec::new(),
            simulation: false,
            verbose: false,
            json_logs: false,
            source_layout: SourceLayout::default(),
            steps: TransferPlan::default_steps(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `XRECOVERY_*` variables and finally
    /// `overrides` (typically parsed command line flags).
    ///
    /// Without an explicit `path` the system file is used if it exists. An
    /// explicit path must exist.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => PathBuf::from(CONFIG_PATH),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", file.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn volume_options(&self) -> VolumeOptions {
        VolumeOptions {
            mount_base: self.mount_base.clone(),
            timeout: Duration::from_secs(self.mount_timeout_secs),
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            filter: DeviceFilter {
                removable_only: self.removable_only,
                min_size: self.min_device_size,
                any_disk_image: self.any_disk_image,
            },
            volume: self.volume_options(),
            source_layout: self.source_layout.clone(),
        }
    }

    pub fn plan(&self) -> TransferPlan {
        TransferPlan::new(self.steps.clone(), &self.additions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", "")?;
            let config = AppConfig::load(Some(Path::new("config.toml")), None::<&Flags>)
                .expect("load");
            assert_eq!(config, AppConfig::default());
            assert_eq!(config.steps.len(), 3);
            Ok(())
        });
    }

    #[test]
    fn test_file_env_and_flags_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                mount_base = "/mnt/recovery"
                min_device_size = 1024
                verbose = false
                simulation = false

                [source_layout]
                base_system = "System"
                install_payload = "Install"
                "#,
            )?;
            jail.set_env("XRECOVERY_MIN_DEVICE_SIZE", "2048");
            jail.set_env("XRECOVERY_VERBOSE", "true");

            let flags = Flags {
                verbose: None,
                simulation: Some(true),
            };
            let config =
                AppConfig::load(Some(Path::new("config.toml")), Some(&flags)).expect("load");

            assert_eq!(config.mount_base, PathBuf::from("/mnt/recovery"));
            assert_eq!(config.min_device_size, 2048);
            assert!(config.verbose);
            assert!(config.simulation);
            assert_eq!(config.source_layout.base_system, PathBuf::from("System"));
            Ok(())
        });
    }

    #[test]
    fn test_custom_steps_from_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [[steps]]
                label = "Copy"
                program = "cp"
                args = ["-r", "{source}/.", "{destination}"]
                "#,
            )?;
            let config = AppConfig::load(Some(Path::new("config.toml")), None::<&Flags>)
                .expect("load");
            assert_eq!(config.steps.len(), 1);
            assert_eq!(config.steps[0].program, PathBuf::from("cp"));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/xrecovery.toml")), None::<&Flags>)
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_derived_options() {
        let config = AppConfig {
            mount_timeout_secs: 5,
            additions: vec![PathBuf::from("/srv/extra")],
            ..AppConfig::default()
        };
        assert_eq!(config.volume_options().timeout, Duration::from_secs(5));
        assert_eq!(config.registry_options().filter.min_size, config.min_device_size);
        assert_eq!(config.plan().len(), 4);
    }
}
