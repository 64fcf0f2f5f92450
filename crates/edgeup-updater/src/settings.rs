use std::time::Duration;

use anyhow::Result;
use edgeup_core::{AssetFilter, RetryPolicy, UpdaterConfig};
use edgeup_installer::{CompanionAssets, InstallLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthGate {
    pub endpoint: String,
    pub retries: u32,
    pub interval: Duration,
    pub confirm_after_rollback: bool,
}

/// Everything a run needs from configuration, resolved and validated once.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub layout: InstallLayout,
    pub filter: AssetFilter,
    pub directories: Vec<String>,
    pub companions: CompanionAssets,
    pub public_key_hex: Option<String>,
    pub health: HealthGate,
    pub registry_retry: RetryPolicy,
    pub download_retry: RetryPolicy,
    pub max_parallel_downloads: usize,
    pub allow_downgrade: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        config.validate()?;
        let public_key_hex = config.assets.public_key_hex.clone();
        Ok(Self {
            layout: InstallLayout::from_config(config),
            filter: config.asset_filter()?,
            directories: config.managed_directories()?,
            companions: CompanionAssets {
                checksum_manifest: config.assets.checksum_manifest.clone(),
                signature: public_key_hex
                    .as_ref()
                    .map(|_| config.assets.signature_asset.clone()),
            },
            public_key_hex,
            health: HealthGate {
                endpoint: config.health.endpoint.clone(),
                retries: config.health.retries,
                interval: config.health.interval(),
                confirm_after_rollback: config.health.confirm_after_rollback,
            },
            registry_retry: config.registry_retry(),
            download_retry: config.download_retry(),
            max_parallel_downloads: config.retry.max_parallel_downloads as usize,
            allow_downgrade: config.policy.allow_downgrade,
        })
    }
}
