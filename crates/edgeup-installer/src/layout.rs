use anyhow::{Context, Result};
use edgeup_core::UpdaterConfig;
use std::fs;
use std::path::{Path, PathBuf};

pub const BACKUP_SUFFIX: &str = "backup";
pub const REJECTED_SUFFIX: &str = "rejected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
    state_dir: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(config.install.root.clone(), config.state_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn active_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn backup_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{BACKUP_SUFFIX}"))
    }

    pub fn rejected_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{REJECTED_SUFFIX}"))
    }

    pub fn staging_root(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn staging_path(&self, run_id: &str) -> PathBuf {
        self.staging_root().join(run_id)
    }

    pub fn installed_state_path(&self) -> PathBuf {
        self.state_dir.join("installed")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn run_metadata_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    pub fn run_journal_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.journal"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("run.lock")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.state_dir.clone(),
            self.staging_root(),
            self.runs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
