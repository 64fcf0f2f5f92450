//! On-disk updater configuration (`edgeup.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::rules::validate_directory_name;
use crate::{AssetFilter, AssetRule, RetryPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgeup/edgeup.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub registry: RegistryConfig,
    pub assets: AssetsConfig,
    pub install: InstallConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Http,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,
    pub url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_registry_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding a bearer token for the registry.
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetsConfig {
    #[serde(default = "default_checksum_manifest")]
    pub checksum_manifest: String,
    #[serde(default = "default_signature_asset")]
    pub signature_asset: String,
    #[serde(default)]
    pub public_key_hex: Option<String>,
    pub rules: Vec<AssetRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub directories: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Systemd,
    Command,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub restart: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub endpoint: String,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub confirm_after_rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub registry_attempts: u32,
    #[serde(default = "default_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_attempts")]
    pub max_parallel_downloads: u32,
    /// Upper bound on one asset transfer, connection included.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub allow_downgrade: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            registry_attempts: default_attempts(),
            download_attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            max_parallel_downloads: default_attempts(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_downgrade: true,
        }
    }
}

impl UpdaterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse edgeup config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.url.trim().is_empty() {
            return Err(anyhow!("registry.url must not be empty"));
        }
        if self.health.endpoint.trim().is_empty() {
            return Err(anyhow!("health.endpoint must not be empty"));
        }
        if self.health.retries == 0 {
            return Err(anyhow!("health.retries must be at least 1"));
        }
        if self.retry.registry_attempts == 0 || self.retry.download_attempts == 0 {
            return Err(anyhow!("retry attempts must be at least 1"));
        }
        if self.retry.download_timeout_secs == 0 {
            return Err(anyhow!("retry.download_timeout_secs must be at least 1"));
        }
        if self.retry.max_parallel_downloads == 0 {
            return Err(anyhow!("retry.max_parallel_downloads must be at least 1"));
        }
        if self.assets.checksum_manifest == self.assets.signature_asset {
            return Err(anyhow!(
                "assets.checksum_manifest and assets.signature_asset must differ"
            ));
        }
        if let Some(key) = &self.assets.public_key_hex {
            if key.len() != 64 || !key.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(anyhow!(
                    "assets.public_key_hex must be 64 hex characters (Ed25519 public key)"
                ));
            }
        }

        let filter = self.asset_filter()?;
        let rule_directories = filter.directories();
        for directory in &self.install.directories {
            validate_directory_name(directory)
                .with_context(|| "invalid entry in install.directories")?;
        }
        if !self.install.directories.is_empty() {
            if let Some(missing) = rule_directories
                .iter()
                .find(|directory| !self.install.directories.contains(directory))
            {
                return Err(anyhow!(
                    "install.directories does not list '{missing}', which an asset rule installs into"
                ));
            }
        }

        match self.service.kind {
            ServiceKind::Systemd if self.service.unit.is_none() => {
                return Err(anyhow!("service.unit is required for systemd services"));
            }
            ServiceKind::Command
                if self.service.start.is_empty() || self.service.stop.is_empty() =>
            {
                return Err(anyhow!(
                    "service.start and service.stop are required for command services"
                ));
            }
            _ => {}
        }

        Ok(())
    }

    pub fn asset_filter(&self) -> Result<AssetFilter> {
        AssetFilter::new(&self.assets.rules)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.install
            .state_dir
            .clone()
            .unwrap_or_else(|| self.install.root.join(".edgeup"))
    }

    /// Directories swapped as one unit: the configured list, or every
    /// directory an asset rule installs into.
    pub fn managed_directories(&self) -> Result<Vec<String>> {
        if !self.install.directories.is_empty() {
            return Ok(self.install.directories.clone());
        }
        Ok(self.asset_filter()?.directories())
    }

    pub fn registry_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.registry_attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.retry.download_timeout_secs)
    }

    pub fn download_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.download_attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_user_agent() -> String {
    format!("edgeup/{}", env!("CARGO_PKG_VERSION"))
}

fn default_registry_timeout_secs() -> u64 {
    30
}

fn default_checksum_manifest() -> String {
    "SHA256SUMS".to_string()
}

fn default_signature_asset() -> String {
    "SHA256SUMS.sig".to_string()
}

fn default_health_retries() -> u32 {
    3
}

fn default_health_interval_secs() -> u64 {
    5
}

fn default_health_timeout_secs() -> u64 {
    2
}

fn default_attempts() -> u32 {
    1
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}
