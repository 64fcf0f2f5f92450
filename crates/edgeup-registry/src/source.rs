use std::path::Path;

use edgeup_core::{ReleaseDescriptor, UpdateError};
use tracing::debug;

use crate::RegistryClient;

/// Reads the latest published release. Side-effect free; retries are the
/// caller's decision.
pub struct ReleaseSource<C> {
    client: C,
}

impl<C: RegistryClient> ReleaseSource<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn get_latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        let document = self
            .client
            .fetch_latest()
            .map_err(|source| UpdateError::Registry { source })?;
        let mut release = ReleaseDescriptor::from_json_str(&document.body)?;

        if let Some(base) = &document.base {
            for asset in &mut release.assets {
                asset.location = resolve_location(base, &asset.location);
            }
        }

        debug!(
            registry = %self.client.describe(),
            tag = %release.tag,
            assets = release.assets.len(),
            "latest release resolved"
        );
        Ok(release)
    }
}

fn resolve_location(base: &Path, location: &str) -> String {
    if location.contains("://") || Path::new(location).is_absolute() {
        return location.to_string();
    }
    base.join(location).display().to_string()
}
