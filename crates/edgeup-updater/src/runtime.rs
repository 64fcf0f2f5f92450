use std::time::Duration;

use anyhow::Result;
use edgeup_core::{ReleaseDescriptor, UpdateError, UpdaterConfig};
use edgeup_installer::{
    service_controller_from_config, CommandUnpacker, HttpArtifactStore, InstallationManager,
    ServiceController,
};
use edgeup_registry::{registry_client_from_config, RegistryClient};
use edgeup_security::Sha256;

use crate::{
    query_latest, Capabilities, HttpHealthProbe, OrchestratorSettings, RunObserver,
    UpdateOrchestrator,
};

/// Production capabilities built from a loaded configuration.
pub struct UpdaterRuntime {
    settings: OrchestratorSettings,
    registry: Box<dyn RegistryClient>,
    store: HttpArtifactStore,
    hasher: Sha256,
    unpacker: CommandUnpacker,
    service: Box<dyn ServiceController>,
    health: HttpHealthProbe,
}

impl UpdaterRuntime {
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        let settings = OrchestratorSettings::from_config(config)?;
        Ok(Self {
            settings,
            registry: registry_client_from_config(&config.registry)?,
            store: HttpArtifactStore::new(
                &config.registry.user_agent,
                Duration::from_secs(config.registry.timeout_secs),
                config.download_timeout(),
            )?,
            hasher: Sha256,
            unpacker: CommandUnpacker,
            service: service_controller_from_config(&config.service)?,
            health: HttpHealthProbe::new(config.health.timeout())?,
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &dyn RegistryClient {
        self.registry.as_ref()
    }

    pub fn service(&self) -> &dyn ServiceController {
        self.service.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities<'_> {
        Capabilities {
            registry: self.registry.as_ref(),
            store: &self.store,
            hasher: &self.hasher,
            unpacker: &self.unpacker,
            service: self.service.as_ref(),
            health: &self.health,
        }
    }

    pub fn orchestrator<'a>(&'a self, observer: &'a dyn RunObserver) -> UpdateOrchestrator<'a> {
        UpdateOrchestrator::new(&self.settings, self.capabilities(), observer)
    }

    pub fn installation_manager(&self) -> InstallationManager<'_> {
        InstallationManager::new(
            &self.settings.layout,
            self.service.as_ref(),
            self.settings.directories.clone(),
        )
    }

    pub fn query_latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        query_latest(self.registry.as_ref(), &self.settings)
    }
}
