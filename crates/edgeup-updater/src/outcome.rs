use std::fmt;

use edgeup_core::{UpdateError, VersionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    CheckingUpdate,
    UpToDate,
    UpdateAvailable,
    Fetching,
    Verifying,
    Unpacking,
    Swapping,
    HealthChecking,
    Promoted,
    RollingBack,
    RolledBack,
    Aborted,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CheckingUpdate => "checking_update",
            Self::UpToDate => "up_to_date",
            Self::UpdateAvailable => "update_available",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Unpacking => "unpacking",
            Self::Swapping => "swapping",
            Self::HealthChecking => "health_checking",
            Self::Promoted => "promoted",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::UpToDate | Self::Promoted | Self::RolledBack | Self::Aborted
        )
    }

    /// States in which the installation is being rewritten; an interruption
    /// here needs an operator.
    pub fn is_unsafe_window(self) -> bool {
        matches!(self, Self::Swapping | Self::RollingBack)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one orchestration run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Another run held the lock; nothing was done.
    Skipped,
    UpToDate {
        installed: VersionTag,
        latest: VersionTag,
    },
    Promoted {
        from: Option<VersionTag>,
        to: VersionTag,
    },
    /// The new release failed its health gate and the previous installation
    /// was restored. `prior_healthy` is `None` when no confirmation check ran.
    RolledBack {
        attempted: VersionTag,
        cause: UpdateError,
        prior_healthy: Option<bool>,
    },
    Aborted {
        state: RunState,
        error: UpdateError,
    },
}

impl RunOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::UpToDate { .. } => "up_to_date",
            Self::Promoted { .. } => "promoted",
            Self::RolledBack { .. } => "rolled_back",
            Self::Aborted { .. } => "aborted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::UpToDate { .. } | Self::Promoted { .. }
        )
    }

    pub fn requires_operator(&self) -> bool {
        match self {
            Self::Aborted { error, .. } => error.requires_operator(),
            _ => false,
        }
    }

    /// 0 no-op or promoted, 1 rolled back, 2 aborted safely, 3 aborted and
    /// needs an operator.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Skipped | Self::UpToDate { .. } | Self::Promoted { .. } => 0,
            Self::RolledBack { .. } => 1,
            Self::Aborted { .. } if self.requires_operator() => 3,
            Self::Aborted { .. } => 2,
        }
    }

    pub fn error(&self) -> Option<&UpdateError> {
        match self {
            Self::RolledBack { cause, .. } => Some(cause),
            Self::Aborted { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Receives progress callbacks from a run. Both hooks default to no-ops.
pub trait RunObserver {
    fn on_transition(&self, _from: RunState, _to: RunState) {}

    fn on_outcome(&self, _outcome: &RunOutcome) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
