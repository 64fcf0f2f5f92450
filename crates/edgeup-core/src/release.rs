use std::collections::HashSet;

use serde::Deserialize;

use crate::{UpdateError, VersionTag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub name: String,
    pub location: String,
}

/// Latest release as reported by the registry. Built fresh for every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub tag: VersionTag,
    pub assets: Vec<AssetDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ReleaseDocument {
    #[serde(alias = "tag")]
    tag_name: String,
    assets: Vec<AssetDocument>,
}

#[derive(Debug, Deserialize)]
struct AssetDocument {
    name: String,
    #[serde(alias = "url")]
    browser_download_url: String,
}

impl ReleaseDescriptor {
    /// Parses and validates a registry response. Nothing downstream ever sees
    /// a descriptor that failed these checks.
    pub fn from_json_str(input: &str) -> Result<Self, UpdateError> {
        let document: ReleaseDocument =
            serde_json::from_str(input).map_err(|err| UpdateError::MalformedRelease {
                detail: format!("failed to parse release document: {err}"),
            })?;

        let tag = VersionTag::parse(&document.tag_name).map_err(|err| {
            UpdateError::MalformedRelease {
                detail: err.to_string(),
            }
        })?;

        let mut seen = HashSet::new();
        let mut assets = Vec::with_capacity(document.assets.len());
        for asset in document.assets {
            validate_asset_name(&asset.name)?;
            if !seen.insert(asset.name.clone()) {
                return Err(UpdateError::MalformedRelease {
                    detail: format!("duplicate asset name '{}' in release {tag}", asset.name),
                });
            }
            let location = asset.browser_download_url.trim();
            if location.is_empty() {
                return Err(UpdateError::MalformedRelease {
                    detail: format!("asset '{}' has an empty download location", asset.name),
                });
            }
            assets.push(AssetDescriptor {
                name: asset.name,
                location: location.to_string(),
            });
        }

        Ok(Self { tag, assets })
    }

    pub fn asset(&self, name: &str) -> Option<&AssetDescriptor> {
        self.assets.iter().find(|asset| asset.name == name)
    }
}

fn validate_asset_name(name: &str) -> Result<(), UpdateError> {
    let invalid = name.trim().is_empty()
        || name != name.trim()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(UpdateError::MalformedRelease {
            detail: format!("invalid asset name '{name}'"),
        });
    }
    Ok(())
}
