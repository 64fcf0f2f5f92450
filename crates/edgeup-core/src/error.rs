//! Failure taxonomy shared by every update component.
//!
//! Components use `anyhow` internally and map into [`UpdateError`] at their
//! boundary, so the orchestrator can decide between abort, rollback, and
//! operator escalation by matching on the variant.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("release registry query failed")]
    Registry {
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed release: {detail}")]
    MalformedRelease { detail: String },

    #[error("release is missing mandatory asset '{name}'")]
    AssetMissing { name: String },

    #[error("failed to download asset '{name}'")]
    Download {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checksum manifest has no entry for '{name}'")]
    ChecksumMissing { name: String },

    #[error("checksum mismatch for '{name}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("checksum manifest signature rejected: {detail}")]
    SignatureInvalid { detail: String },

    #[error("failed to unpack asset '{name}'")]
    Unpack {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backup from an unfinished run exists at {}; operator attention required", .path.display())]
    StaleBackup { path: PathBuf },

    #[error("install swap failed; previous installation {}", restored_label(.restored))]
    Swap {
        restored: bool,
        #[source]
        source: anyhow::Error,
    },

    #[error("health gate failed after {attempts} attempt(s) against {endpoint}")]
    HealthCheckFailed { endpoint: String, attempts: u32 },

    #[error("rollback failed; installation is in an unknown state")]
    RollbackFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("new release is active but could not be finalized")]
    Promote {
        #[source]
        source: anyhow::Error,
    },

    #[error("installed state is unreadable or unwritable")]
    State {
        #[source]
        source: anyhow::Error,
    },

    #[error("staging workspace failure")]
    Workspace {
        #[source]
        source: anyhow::Error,
    },

    #[error("managed service control failed")]
    Service {
        #[source]
        source: anyhow::Error,
    },
}

fn restored_label(restored: &bool) -> &'static str {
    if *restored {
        "restored"
    } else {
        "NOT restored"
    }
}

impl UpdateError {
    /// Stable token used in run journals and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry { .. } => "registry",
            Self::MalformedRelease { .. } => "malformed_release",
            Self::AssetMissing { .. } => "asset_missing",
            Self::Download { .. } => "download",
            Self::ChecksumMissing { .. } => "checksum_missing",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::Unpack { .. } => "unpack",
            Self::StaleBackup { .. } => "stale_backup",
            Self::Swap { .. } => "swap",
            Self::HealthCheckFailed { .. } => "health_check_failed",
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::Promote { .. } => "promote",
            Self::State { .. } => "state",
            Self::Workspace { .. } => "workspace",
            Self::Service { .. } => "service",
        }
    }

    /// True when the installation may be in a state no automatic path can
    /// resolve. These are never retried.
    pub fn requires_operator(&self) -> bool {
        match self {
            Self::StaleBackup { .. } | Self::RollbackFailed { .. } | Self::Promote { .. } => true,
            Self::Swap { restored, .. } => !restored,
            _ => false,
        }
    }

    /// Whether a fresh attempt of the same step can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Registry { .. } | Self::Download { .. })
    }

    /// Renders the error with its full cause chain on one line.
    pub fn display_chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        rendered
    }
}
