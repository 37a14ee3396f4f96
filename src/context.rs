use std::sync::Arc;

use crate::adapters::Simulator;
use crate::config::AppConfig;
use crate::core::DiskArbiter;
use crate::core::registry::VolumeRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<VolumeRegistry>,
    /// Present when running against the simulated arbiter.
    pub simulator: Option<Simulator>,
}

impl AppContext {
    pub fn new(config: AppConfig, arbiter: Arc<dyn DiskArbiter>, simulator: Option<Simulator>) -> Self {
        let registry = Arc::new(VolumeRegistry::new(arbiter, config.registry_options()));
        Self {
            config: Arc::new(config),
            registry,
            simulator,
        }
    }
}
