mod archive;
mod checksum;
mod config;
mod error;
mod fetched;
mod release;
mod retry;
mod rules;
mod tag;

pub use archive::ArchiveType;
pub use checksum::ChecksumManifest;
pub use config::{
    AssetsConfig, HealthConfig, InstallConfig, PolicyConfig, RegistryConfig, RegistryKind,
    RetryConfig, ServiceConfig, ServiceKind, UpdaterConfig, DEFAULT_CONFIG_PATH,
};
pub use error::UpdateError;
pub use fetched::{FetchedAsset, FetchedAssets};
pub use release::{AssetDescriptor, ReleaseDescriptor};
pub use retry::RetryPolicy;
pub use rules::{AssetFilter, AssetRole, AssetRule, SelectedAsset};
pub use tag::VersionTag;
