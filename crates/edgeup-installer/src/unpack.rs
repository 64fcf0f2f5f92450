use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use edgeup_core::{ArchiveType, FetchedAsset, FetchedAssets, UpdateError, VersionTag};
use tracing::debug;

use crate::fs_utils::make_executable;
use crate::StagingWorkspace;

/// Places the content of one verified asset into a staged directory.
pub trait Unpacker: Send + Sync {
    fn unpack(&self, asset: &FetchedAsset, destination: &Path) -> Result<()>;
}

/// Extracts archives with the system `tar`/`unzip` tools and copies raw
/// assets as a single executable file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandUnpacker;

impl Unpacker for CommandUnpacker {
    fn unpack(&self, asset: &FetchedAsset, destination: &Path) -> Result<()> {
        match asset.asset.archive {
            ArchiveType::TarGz | ArchiveType::Tar => extract_tar(&asset.path, destination),
            ArchiveType::Zip => extract_zip(&asset.path, destination),
            ArchiveType::Raw => {
                let file_name = asset
                    .asset
                    .install_name
                    .as_deref()
                    .unwrap_or_else(|| asset.name());
                let target = destination.join(file_name);
                if target.exists() {
                    return Err(anyhow!(
                        "staged file already exists: {}",
                        target.display()
                    ));
                }
                fs::copy(&asset.path, &target).with_context(|| {
                    format!(
                        "failed to copy {} to {}",
                        asset.path.display(),
                        target.display()
                    )
                })?;
                make_executable(&target)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTree {
    pub name: String,
    pub path: PathBuf,
}

/// A release fully laid out in the workspace, one tree per managed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRelease {
    pub tag: VersionTag,
    pub trees: Vec<StagedTree>,
}

impl StagedRelease {
    pub fn tree(&self, name: &str) -> Option<&StagedTree> {
        self.trees.iter().find(|tree| tree.name == name)
    }
}

/// Builds a staged tree for every managed directory, empty when the release
/// ships nothing for it.
pub fn stage_release(
    unpacker: &dyn Unpacker,
    tag: &VersionTag,
    fetched: &FetchedAssets,
    directories: &[String],
    workspace: &StagingWorkspace,
) -> Result<StagedRelease, UpdateError> {
    let mut trees = Vec::with_capacity(directories.len());
    for name in directories {
        let path = workspace.staged_directory(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create staged dir: {}", path.display()))
            .map_err(|source| UpdateError::Workspace { source })?;
        trees.push(StagedTree {
            name: name.clone(),
            path,
        });
    }

    for asset in &fetched.assets {
        let tree = trees
            .iter()
            .find(|tree| tree.name == asset.asset.directory)
            .ok_or_else(|| UpdateError::Unpack {
                name: asset.name().to_string(),
                source: anyhow!(
                    "directory '{}' is not a managed directory",
                    asset.asset.directory
                ),
            })?;
        debug!(
            asset = asset.name(),
            archive = asset.asset.archive.as_str(),
            directory = %tree.name,
            "unpacking asset"
        );
        unpacker
            .unpack(asset, &tree.path)
            .map_err(|source| UpdateError::Unpack {
                name: asset.name().to_string(),
                source,
            })?;
    }

    Ok(StagedRelease {
        tag: tag.clone(),
        trees,
    })
}

fn extract_tar(archive_path: &Path, dst: &Path) -> Result<()> {
    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract tar archive",
    )
}

fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    let mut unzip_command = Command::new("unzip");
    unzip_command
        .arg("-q")
        .arg("-o")
        .arg(archive_path)
        .arg("-d")
        .arg(dst);
    if run_command(
        &mut unzip_command,
        "failed to extract zip archive with unzip",
    )
    .is_ok()
    {
        return Ok(());
    }

    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract zip archive with tar fallback",
    )
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
