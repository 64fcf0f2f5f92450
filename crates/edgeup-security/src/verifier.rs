use std::path::PathBuf;

use edgeup_core::{ChecksumManifest, FetchedAsset, UpdateError};
use tracing::{debug, warn};

use crate::HashAlgorithm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAsset {
    pub name: String,
    pub path: PathBuf,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub algorithm: &'static str,
    pub assets: Vec<VerifiedAsset>,
}

/// All-or-nothing check of fetched assets against a checksum manifest.
pub struct ChecksumVerifier<'a> {
    hasher: &'a dyn HashAlgorithm,
}

impl<'a> ChecksumVerifier<'a> {
    pub fn new(hasher: &'a dyn HashAlgorithm) -> Self {
        Self { hasher }
    }

    /// Every asset is checked even after a failure so each bad asset gets
    /// logged; the first failure in fetch order is returned.
    pub fn verify(
        &self,
        assets: &[FetchedAsset],
        manifest: &ChecksumManifest,
    ) -> Result<VerificationResult, UpdateError> {
        let mut verified = Vec::with_capacity(assets.len());
        let mut first_failure = None;

        for asset in assets {
            match self.verify_one(asset, manifest) {
                Ok(entry) => {
                    debug!(asset = %entry.name, digest = %entry.digest, "checksum verified");
                    verified.push(entry);
                }
                Err(err) => {
                    warn!(asset = asset.name(), error = %err.display_chain(), "checksum rejected");
                    first_failure.get_or_insert(err);
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(VerificationResult {
                algorithm: self.hasher.name(),
                assets: verified,
            }),
        }
    }

    fn verify_one(
        &self,
        asset: &FetchedAsset,
        manifest: &ChecksumManifest,
    ) -> Result<VerifiedAsset, UpdateError> {
        let name = asset.name();
        let expected = manifest
            .expected(name)
            .ok_or_else(|| UpdateError::ChecksumMissing {
                name: name.to_string(),
            })?;

        // an unreadable download cannot be trusted any more than a mismatch
        let actual = self
            .hasher
            .hash_file(&asset.path)
            .map_err(|source| UpdateError::Download {
                name: name.to_string(),
                source,
            })?;

        if !actual.eq_ignore_ascii_case(expected) {
            return Err(UpdateError::ChecksumMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        Ok(VerifiedAsset {
            name: name.to_string(),
            path: asset.path.clone(),
            digest: actual.to_ascii_lowercase(),
        })
    }
}
