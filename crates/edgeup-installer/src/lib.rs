mod fetch;
mod fs_utils;
mod journal;
mod layout;
mod lock;
mod service;
mod state;
mod store;
mod swap;
mod unpack;
mod workspace;

pub use fetch::{ArtifactFetcher, CompanionAssets};
pub use journal::{
    append_journal_entry, current_unix_timestamp, latest_run, list_runs, new_run_id, prune_runs,
    read_journal, read_run_metadata, write_run_metadata, JournalEntry, RunJournal, RunMetadata,
    RUNS_TO_KEEP, RUN_METADATA_VERSION,
};
pub use layout::{InstallLayout, BACKUP_SUFFIX, REJECTED_SUFFIX};
pub use lock::RunLock;
pub use service::{
    service_controller_from_config, CommandServiceController, NoopServiceController,
    ServiceController, SystemdServiceController,
};
pub use state::{read_installed_state, write_installed_state, InstalledState};
pub use store::{ArtifactStore, HttpArtifactStore};
pub use swap::{InstallationManager, SwapHandle, SwappedDirectory};
pub use unpack::{stage_release, CommandUnpacker, StagedRelease, StagedTree, Unpacker};
pub use workspace::{discard_stale_workspaces, StagingWorkspace};
