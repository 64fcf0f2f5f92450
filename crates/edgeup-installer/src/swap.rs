//! Swapping staged trees into the active installation and back.
//!
//! At every point of a swap each managed directory is complete under either
//! its active name or its `.backup` name, so a recovery path always exists.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use edgeup_core::{UpdateError, VersionTag};
use tracing::{error, info, warn};

use crate::fs_utils::{move_dir_or_copy, remove_dir_if_exists, sync_dir};
use crate::{
    current_unix_timestamp, write_installed_state, InstallLayout, InstalledState,
    ServiceController, StagedRelease,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwappedDirectory {
    pub name: String,
    pub active: PathBuf,
    pub backup: PathBuf,
    /// False when the directory did not exist before the swap, so rollback
    /// removes it instead of restoring a backup.
    pub had_previous: bool,
}

/// Proof that a swap completed. Consumed by exactly one of promote or
/// rollback.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a swap must be promoted or rolled back"]
pub struct SwapHandle {
    pub tag: VersionTag,
    pub directories: Vec<SwappedDirectory>,
}

pub struct InstallationManager<'a> {
    layout: &'a InstallLayout,
    service: &'a dyn ServiceController,
    directories: Vec<String>,
}

impl<'a> InstallationManager<'a> {
    pub fn new(
        layout: &'a InstallLayout,
        service: &'a dyn ServiceController,
        directories: Vec<String>,
    ) -> Self {
        Self {
            layout,
            service,
            directories,
        }
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    /// Backups left behind by a run that never reached promote or rollback.
    pub fn stale_backups(&self) -> Vec<PathBuf> {
        self.directories
            .iter()
            .map(|name| self.layout.backup_dir(name))
            .filter(|path| path.exists())
            .collect()
    }

    pub fn check_no_stale_backups(&self) -> Result<(), UpdateError> {
        match self.stale_backups().into_iter().next() {
            Some(path) => Err(UpdateError::StaleBackup { path }),
            None => Ok(()),
        }
    }

    /// Stops the service, moves each active directory aside and the staged
    /// tree into its place, then starts the service again.
    pub fn swap(&self, staged: &StagedRelease) -> Result<SwapHandle, UpdateError> {
        self.check_no_stale_backups()?;

        let mut sources = Vec::with_capacity(self.directories.len());
        for name in &self.directories {
            let tree = staged.tree(name).ok_or_else(|| UpdateError::Workspace {
                source: anyhow!("release {} has no staged tree for '{name}'", staged.tag),
            })?;
            sources.push((name.as_str(), tree.path.as_path()));
        }
        for name in &self.directories {
            let rejected = self.layout.rejected_dir(name);
            if let Err(err) = remove_dir_if_exists(&rejected) {
                warn!(
                    path = %rejected.display(),
                    error = %err,
                    "failed to clear rejected tree from an earlier run"
                );
            }
        }

        info!(service = %self.service.describe(), "stopping service for swap");
        if let Err(err) = self.service.stop() {
            if let Err(start_err) = self.service.start() {
                warn!(error = %start_err, "failed to start service after aborted stop");
            }
            return Err(UpdateError::Service {
                source: err.context("failed to stop service before swap"),
            });
        }

        let mut swapped = Vec::with_capacity(sources.len());
        for (name, source) in sources {
            match self.swap_one(name, source) {
                Ok(directory) => swapped.push(directory),
                Err((partial, err)) => {
                    swapped.extend(partial);
                    error!(directory = name, error = %err, "swap failed; restoring previous installation");
                    let restored = self.restore_all(&swapped);
                    if let Err(start_err) = self.service.start() {
                        warn!(error = %start_err, "failed to start service after restore");
                    }
                    return Err(UpdateError::Swap {
                        restored,
                        source: err,
                    });
                }
            }
        }
        if let Err(err) = sync_dir(self.layout.root()) {
            warn!(error = %err, "failed to sync install root after swap");
        }

        if let Err(err) = self.service.start() {
            warn!(error = %err, "service failed to start after swap; health gate will decide");
        }

        info!(tag = %staged.tag, directories = swapped.len(), "swap complete");
        Ok(SwapHandle {
            tag: staged.tag.clone(),
            directories: swapped,
        })
    }

    /// On failure returns the directory when it was already moved to backup,
    /// so the caller can restore it with the rest.
    fn swap_one(
        &self,
        name: &str,
        staged: &Path,
    ) -> Result<SwappedDirectory, (Option<SwappedDirectory>, anyhow::Error)> {
        let active = self.layout.active_dir(name);
        let backup = self.layout.backup_dir(name);
        let had_previous = active.exists();

        if had_previous {
            fs::rename(&active, &backup)
                .with_context(|| {
                    format!(
                        "failed to move {} aside to {}",
                        active.display(),
                        backup.display()
                    )
                })
                .map_err(|err| (None, err))?;
        }

        let directory = SwappedDirectory {
            name: name.to_string(),
            active: active.clone(),
            backup,
            had_previous,
        };
        if let Err(err) = move_dir_or_copy(staged, &active) {
            return Err((
                Some(directory),
                err.context(format!("failed to activate staged tree for '{name}'")),
            ));
        }
        Ok(directory)
    }

    /// Best-effort restore in reverse swap order. True when every directory
    /// is back in its pre-swap state.
    fn restore_all(&self, swapped: &[SwappedDirectory]) -> bool {
        let mut restored = true;
        for directory in swapped.iter().rev() {
            if let Err(err) = self.restore_one(directory) {
                error!(directory = %directory.name, error = %err, "failed to restore directory");
                restored = false;
            }
        }
        restored
    }

    fn restore_one(&self, directory: &SwappedDirectory) -> Result<()> {
        let rejected = self.layout.rejected_dir(&directory.name);
        if directory.active.exists() {
            remove_dir_if_exists(&rejected)
                .with_context(|| format!("failed to clear {}", rejected.display()))?;
            fs::rename(&directory.active, &rejected).with_context(|| {
                format!(
                    "failed to move rejected tree {} aside",
                    directory.active.display()
                )
            })?;
        }
        if directory.had_previous {
            fs::rename(&directory.backup, &directory.active).with_context(|| {
                format!(
                    "failed to restore {} from {}",
                    directory.active.display(),
                    directory.backup.display()
                )
            })?;
        }
        if let Err(err) = remove_dir_if_exists(&rejected) {
            warn!(path = %rejected.display(), error = %err, "failed to remove rejected tree");
        }
        Ok(())
    }

    /// Drops the backups and records the new tag as installed. Only called
    /// after a passing health gate.
    pub fn promote(&self, handle: SwapHandle) -> Result<InstalledState, UpdateError> {
        for directory in &handle.directories {
            if directory.had_previous {
                fs::remove_dir_all(&directory.backup)
                    .with_context(|| {
                        format!("failed to remove backup {}", directory.backup.display())
                    })
                    .map_err(|source| UpdateError::Promote { source })?;
            }
        }

        let state = InstalledState {
            tag: handle.tag.clone(),
            directories: self.directories.clone(),
            installed_at_unix: current_unix_timestamp()
                .map_err(|source| UpdateError::Promote { source })?,
        };
        write_installed_state(self.layout, &state).map_err(|source| UpdateError::Promote { source })?;
        info!(tag = %state.tag, "release promoted");
        Ok(state)
    }

    /// Restores the backups over the new trees. Installed state is left
    /// untouched. After a first install there is nothing to start.
    pub fn rollback(&self, handle: SwapHandle) -> Result<(), UpdateError> {
        info!(tag = %handle.tag, "rolling back");
        if let Err(err) = self.service.stop() {
            warn!(error = %err, "failed to stop service before rollback; continuing");
        }

        if !self.restore_all(&handle.directories) {
            return Err(UpdateError::RollbackFailed {
                source: anyhow!(
                    "one or more directories could not be restored from backup under {}",
                    self.layout.root().display()
                ),
            });
        }
        if let Err(err) = sync_dir(self.layout.root()) {
            warn!(error = %err, "failed to sync install root after rollback");
        }

        if handle.directories.iter().all(|directory| !directory.had_previous) {
            info!("no previous installation; service left stopped");
            return Ok(());
        }
        self.service
            .start()
            .context("previous installation restored but the service did not start")
            .map_err(|source| UpdateError::RollbackFailed { source })?;
        info!("previous installation restored");
        Ok(())
    }
}
