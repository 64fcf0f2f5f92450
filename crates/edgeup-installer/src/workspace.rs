use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::fs_utils::remove_dir_if_exists;
use crate::InstallLayout;

/// Staging directory owned by exactly one run. Dropping the guard removes
/// the directory, so every exit path releases it.
#[derive(Debug)]
pub struct StagingWorkspace {
    run_id: String,
    path: PathBuf,
}

impl StagingWorkspace {
    pub fn create(layout: &InstallLayout, run_id: &str) -> Result<Self> {
        let path = layout.staging_path(run_id);
        remove_dir_if_exists(&path)
            .with_context(|| format!("failed to clear staging dir: {}", path.display()))?;
        let workspace = Self {
            run_id: run_id.to_string(),
            path,
        };
        for dir in [workspace.downloads_dir(), workspace.staged_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(workspace)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.path.join("downloads")
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.path.join("staged")
    }

    pub fn staged_directory(&self, name: &str) -> PathBuf {
        self.staged_dir().join(name)
    }
}

impl Drop for StagingWorkspace {
    fn drop(&mut self) {
        if let Err(err) = remove_dir_if_exists(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove staging workspace"
            );
        }
    }
}

/// Removes workspaces left behind by runs that never terminated. Returns the
/// removed paths.
pub fn discard_stale_workspaces(layout: &InstallLayout) -> Result<Vec<PathBuf>> {
    let root = layout.staging_root();
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    for entry in fs::read_dir(&root)
        .with_context(|| format!("failed to read staging root: {}", root.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| {
                format!("failed to remove stale staging dir: {}", path.display())
            })?;
        } else {
            fs::remove_file(&path).with_context(|| {
                format!("failed to remove stale staging file: {}", path.display())
            })?;
        }
        info!(path = %path.display(), "discarded staging workspace from an unfinished run");
        removed.push(path);
    }
    removed.sort();
    Ok(removed)
}
