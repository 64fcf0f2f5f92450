use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Context;
use edgeup_core::{
    AssetDescriptor, AssetFilter, FetchedAsset, FetchedAssets, ReleaseDescriptor, RetryPolicy,
    UpdateError,
};
use tracing::{debug, info};

use crate::{ArtifactStore, StagingWorkspace};

/// Release companions that are fetched alongside the selected assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionAssets {
    pub checksum_manifest: String,
    /// Set when the manifest must carry a detached signature.
    pub signature: Option<String>,
}

/// Downloads the selected assets of one release into a staging workspace.
pub struct ArtifactFetcher<'a> {
    store: &'a dyn ArtifactStore,
    filter: &'a AssetFilter,
    companions: CompanionAssets,
    retry: RetryPolicy,
    max_parallel: usize,
}

impl<'a> ArtifactFetcher<'a> {
    pub fn new(
        store: &'a dyn ArtifactStore,
        filter: &'a AssetFilter,
        companions: CompanionAssets,
    ) -> Self {
        Self {
            store,
            filter,
            companions,
            retry: RetryPolicy::once(),
            max_parallel: 1,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Any failure aborts the whole fetch. Files already written stay in the
    /// workspace and go away with it.
    pub fn fetch(
        &self,
        release: &ReleaseDescriptor,
        workspace: &StagingWorkspace,
    ) -> Result<FetchedAssets, UpdateError> {
        let manifest = required_asset(release, &self.companions.checksum_manifest)?;
        let signature = match &self.companions.signature {
            Some(name) => Some(required_asset(release, name)?),
            None => None,
        };

        let mut reserved = vec![self.companions.checksum_manifest.as_str()];
        if let Some(name) = &self.companions.signature {
            reserved.push(name.as_str());
        }
        let selected = self.filter.select(release, &reserved)?;

        let mut jobs: Vec<&AssetDescriptor> = vec![manifest];
        jobs.extend(signature);
        jobs.extend(selected.iter().map(|asset| &asset.descriptor));

        let downloads_dir = workspace.downloads_dir();
        let mut paths = self.download_all(&jobs, &downloads_dir)?.into_iter();

        let manifest_path = paths.next().ok_or_else(|| missing(manifest))?;
        let signature_path = match signature {
            Some(descriptor) => Some(paths.next().ok_or_else(|| missing(descriptor))?),
            None => None,
        };
        let assets = selected
            .into_iter()
            .zip(paths)
            .map(|(asset, path)| FetchedAsset { asset, path })
            .collect::<Vec<_>>();

        info!(
            tag = %release.tag,
            assets = assets.len(),
            signed = signature_path.is_some(),
            "release assets fetched"
        );
        Ok(FetchedAssets {
            assets,
            manifest_path,
            signature_path,
        })
    }

    fn download_all(
        &self,
        jobs: &[&AssetDescriptor],
        downloads_dir: &Path,
    ) -> Result<Vec<PathBuf>, UpdateError> {
        if self.max_parallel <= 1 || jobs.len() <= 1 {
            return jobs
                .iter()
                .map(|descriptor| self.download_with_retry(descriptor, downloads_dir))
                .collect();
        }

        let mut paths = Vec::with_capacity(jobs.len());
        for chunk in jobs.chunks(self.max_parallel) {
            let results = thread::scope(|scope| {
                let handles = chunk
                    .iter()
                    .map(|descriptor| {
                        scope.spawn(move || self.download_with_retry(descriptor, downloads_dir))
                    })
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .zip(chunk.iter())
                    .map(|(handle, descriptor)| {
                        handle.join().unwrap_or_else(|_| {
                            Err(UpdateError::Download {
                                name: descriptor.name.clone(),
                                source: anyhow::anyhow!("download worker panicked"),
                            })
                        })
                    })
                    .collect::<Vec<_>>()
            });
            // descriptor order decides which failure is reported
            for result in results {
                paths.push(result?);
            }
        }
        Ok(paths)
    }

    fn download_with_retry(
        &self,
        descriptor: &AssetDescriptor,
        downloads_dir: &Path,
    ) -> Result<PathBuf, UpdateError> {
        self.retry.run(
            &format!("download {}", descriptor.name),
            |attempt| {
                debug!(asset = %descriptor.name, attempt, "downloading asset");
                download_asset(self.store, descriptor, downloads_dir).map_err(|source| {
                    UpdateError::Download {
                        name: descriptor.name.clone(),
                        source,
                    }
                })
            },
            UpdateError::is_transient,
        )
    }
}

fn download_asset(
    store: &dyn ArtifactStore,
    descriptor: &AssetDescriptor,
    downloads_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let final_path = downloads_dir.join(&descriptor.name);
    let part_path = downloads_dir.join(format!("{}.part", descriptor.name));

    if let Err(err) = store.fetch_to(&descriptor.location, &part_path) {
        let _ = fs::remove_file(&part_path);
        return Err(err);
    }

    fs::rename(&part_path, &final_path).with_context(|| {
        format!(
            "failed to move downloaded asset into place: {}",
            final_path.display()
        )
    })?;
    Ok(final_path)
}

fn required_asset<'r>(
    release: &'r ReleaseDescriptor,
    name: &str,
) -> Result<&'r AssetDescriptor, UpdateError> {
    release.asset(name).ok_or_else(|| UpdateError::AssetMissing {
        name: name.to_string(),
    })
}

fn missing(descriptor: &AssetDescriptor) -> UpdateError {
    UpdateError::AssetMissing {
        name: descriptor.name.clone(),
    }
}
