use std::path::PathBuf;

use crate::SelectedAsset;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub asset: SelectedAsset,
    pub path: PathBuf,
}

impl FetchedAsset {
    pub fn name(&self) -> &str {
        &self.asset.descriptor.name
    }
}

/// Everything one fetch placed in the staging workspace. Paths point inside
/// that workspace and die with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAssets {
    pub assets: Vec<FetchedAsset>,
    pub manifest_path: PathBuf,
    pub signature_path: Option<PathBuf>,
}
