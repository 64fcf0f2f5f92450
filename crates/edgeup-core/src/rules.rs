use std::path::{Component, Path};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ArchiveType, AssetDescriptor, ReleaseDescriptor, UpdateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetRole {
    Primary,
    Plugin,
}

impl AssetRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Plugin => "plugin",
        }
    }
}

/// Selects release assets by name and says where their content is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRule {
    pub pattern: String,
    pub role: AssetRole,
    pub directory: String,
    pub archive: Option<String>,
    /// File name used when a non-archive asset is installed.
    pub install_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAsset {
    pub descriptor: AssetDescriptor,
    pub role: AssetRole,
    pub directory: String,
    pub archive: ArchiveType,
    pub install_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AssetFilter {
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: AssetRule,
    regex: Regex,
    archive: Option<ArchiveType>,
}

impl AssetFilter {
    pub fn new(rules: &[AssetRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = Regex::new(&rule.pattern)
                .with_context(|| format!("invalid asset pattern '{}'", rule.pattern))?;
            validate_directory_name(&rule.directory).with_context(|| {
                format!("invalid install directory for pattern '{}'", rule.pattern)
            })?;
            let archive = match rule.archive.as_deref() {
                Some(raw) => Some(ArchiveType::parse(raw).ok_or_else(|| {
                    anyhow!(
                        "unsupported archive type '{raw}' for pattern '{}'; supported: tar.gz, tar, zip, raw",
                        rule.pattern
                    )
                })?),
                None => None,
            };
            if let Some(install_name) = &rule.install_name {
                validate_directory_name(install_name).with_context(|| {
                    format!("invalid install_name for pattern '{}'", rule.pattern)
                })?;
            }
            compiled.push(CompiledRule {
                rule: rule.clone(),
                regex,
                archive,
            });
        }

        let primary_rules = compiled
            .iter()
            .filter(|rule| rule.rule.role == AssetRole::Primary)
            .count();
        if primary_rules != 1 {
            return Err(anyhow!(
                "exactly one primary asset rule is required, found {primary_rules}"
            ));
        }

        Ok(Self { rules: compiled })
    }

    /// Managed directory names in first-seen rule order.
    pub fn directories(&self) -> Vec<String> {
        let mut directories: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !directories.contains(&rule.rule.directory) {
                directories.push(rule.rule.directory.clone());
            }
        }
        directories
    }

    /// Picks every asset matched by a rule; the first matching rule wins.
    /// Names in `reserved` (manifest, signature) are never selected.
    pub fn select(
        &self,
        release: &ReleaseDescriptor,
        reserved: &[&str],
    ) -> Result<Vec<SelectedAsset>, UpdateError> {
        let mut selected = Vec::new();
        for asset in &release.assets {
            if reserved.contains(&asset.name.as_str()) {
                continue;
            }
            let Some(rule) = self.rules.iter().find(|rule| rule.regex.is_match(&asset.name))
            else {
                tracing::debug!(asset = %asset.name, "asset matches no rule; ignored");
                continue;
            };
            selected.push(SelectedAsset {
                descriptor: asset.clone(),
                role: rule.rule.role,
                directory: rule.rule.directory.clone(),
                archive: rule
                    .archive
                    .unwrap_or_else(|| ArchiveType::infer_from_name(&asset.name)),
                install_name: rule.rule.install_name.clone(),
            });
        }

        let primary_names = selected
            .iter()
            .filter(|asset| asset.role == AssetRole::Primary)
            .map(|asset| asset.descriptor.name.clone())
            .collect::<Vec<_>>();
        match primary_names.len() {
            0 => {
                let pattern = self
                    .rules
                    .iter()
                    .find(|rule| rule.rule.role == AssetRole::Primary)
                    .map(|rule| rule.rule.pattern.clone())
                    .unwrap_or_default();
                Err(UpdateError::AssetMissing {
                    name: format!("primary asset matching /{pattern}/"),
                })
            }
            1 => Ok(selected),
            count => Err(UpdateError::MalformedRelease {
                detail: format!(
                    "release {} has {count} assets matching the primary rule: {}",
                    release.tag,
                    primary_names.join(", ")
                ),
            }),
        }
    }
}

pub(crate) fn validate_directory_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None)
            if !name.ends_with(".backup") && !name.ends_with(".rejected") =>
        {
            Ok(())
        }
        _ => Err(anyhow!(
            "'{name}' must be a single plain path component not ending in .backup or .rejected"
        )),
    }
}
