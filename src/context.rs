use std::sync::Arc;
use std::time::Instant;

use tokio_rusqlite::Connection;

use crate::adapters;
use crate::config::{AppConfig, FileConfigProvider};
use crate::core::transfer_engine::{EngineSettings, create_copier};
use crate::core::{DeviceProbe, DriveMonitor, MountManager, Orchestrator, OrchestratorSettings};

/// Everything the RPC and web surfaces need, shared by clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub orchestrator: Arc<Orchestrator>,
    pub probe: Arc<dyn DeviceProbe>,
    pub drives: Arc<DriveMonitor>,
    pub config_provider: Arc<FileConfigProvider>,
    pub started: Instant,
}

impl AppContext {
    /// Wire the daemon from configuration, picking system or simulated
    /// adapters.
    pub fn new(config: AppConfig, db: Connection) -> Self {
        let probe = adapters::get_device_probe(config.simulation);
        let mounts = Arc::new(MountManager::new(adapters::get_mount_backend(
            config.simulation,
        )));
        let config_provider = Arc::new(FileConfigProvider::new(&config.config_path));

        let orchestrator = Orchestrator::new(
            config_provider.clone(),
            mounts,
            create_copier(config.copy_engine),
            probe.clone(),
            Some(db.clone()),
            OrchestratorSettings {
                engine: EngineSettings {
                    source_mount: config.source_mount.clone(),
                    destination_mount: config.destination_mount.clone(),
                },
                sample_interval: config.sample_interval(),
            },
        );

        Self::with_parts(config, db, Arc::new(orchestrator), probe, config_provider)
    }

    pub fn with_parts(
        config: AppConfig,
        db: Connection,
        orchestrator: Arc<Orchestrator>,
        probe: Arc<dyn DeviceProbe>,
        config_provider: Arc<FileConfigProvider>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            orchestrator,
            probe,
            drives: Arc::new(DriveMonitor::new()),
            config_provider,
            started: Instant::now(),
        }
    }
}
