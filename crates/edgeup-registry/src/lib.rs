mod client;
mod source;

pub use client::{
    registry_client_from_config, FilesystemRegistryClient, HttpRegistryClient, RegistryClient,
    RegistryDocument, FILESYSTEM_RELEASE_FILE,
};
pub use source::ReleaseSource;
