//! The update state machine.
//!
//! `Idle -> CheckingUpdate -> {UpToDate | UpdateAvailable} -> Fetching ->
//! Verifying -> Unpacking -> Swapping -> HealthChecking -> {Promoted |
//! RollingBack -> RolledBack}`, with `Aborted` reachable from every
//! non-terminal state. Nothing under the install root changes before
//! `Swapping`, and a run that ends up to date writes nothing but the lock.

use std::cmp::Ordering;
use std::fs;

use anyhow::Context;
use edgeup_core::{ChecksumManifest, FetchedAssets, ReleaseDescriptor, UpdateError, VersionTag};
use edgeup_installer::{
    discard_stale_workspaces, new_run_id, prune_runs, read_installed_state, stage_release,
    ArtifactFetcher, ArtifactStore, InstallLayout, InstallationManager, InstalledState, RunJournal,
    RunLock, ServiceController, StagingWorkspace, Unpacker, RUNS_TO_KEEP,
};
use edgeup_registry::{RegistryClient, ReleaseSource};
use edgeup_security::{verify_manifest_signature, ChecksumVerifier, HashAlgorithm};
use tracing::{error, info, warn};

use crate::{HealthProbe, OrchestratorSettings, RunObserver, RunOutcome, RunState};

/// External collaborators of a run, all behind capability traits.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub registry: &'a dyn RegistryClient,
    pub store: &'a dyn ArtifactStore,
    pub hasher: &'a dyn HashAlgorithm,
    pub unpacker: &'a dyn Unpacker,
    pub service: &'a dyn ServiceController,
    pub health: &'a dyn HealthProbe,
}

/// Per-run values threaded through every step.
struct RunContext<'o> {
    run_id: String,
    state: RunState,
    installed: Option<InstalledState>,
    journal: Option<RunJournal>,
    /// Transitions made before the journal was opened.
    pending: Vec<(RunState, Option<String>)>,
    observer: &'o dyn RunObserver,
}

impl RunContext<'_> {
    fn transition(&mut self, to: RunState, detail: Option<String>) {
        let from = self.state;
        self.state = to;
        info!(run = %self.run_id, from = %from, to = %to, "state transition");
        match &mut self.journal {
            Some(journal) => {
                if let Err(err) = journal.record(to.as_str(), detail) {
                    warn!(error = %err, "failed to append run journal");
                }
            }
            None => self.pending.push((to, detail)),
        }
        self.observer.on_transition(from, to);
    }

    /// Starts the run record and replays the transitions made so far. Runs
    /// that end up to date never get here, so they leave no record behind.
    fn open_journal(&mut self, layout: &InstallLayout) -> anyhow::Result<()> {
        if self.journal.is_some() {
            return Ok(());
        }
        if self.run_id.is_empty() {
            self.run_id = new_run_id()?;
        }
        let mut journal = RunJournal::begin(layout, &self.run_id, self.installed_tag())?;
        for (state, detail) in self.pending.drain(..) {
            journal.record(state.as_str(), detail)?;
        }
        self.journal = Some(journal);
        if let Err(err) = prune_runs(layout, RUNS_TO_KEEP) {
            warn!(error = %err, "failed to prune old run records");
        }
        Ok(())
    }

    fn abort(&mut self, error: UpdateError) -> RunOutcome {
        let state = self.state;
        if error.requires_operator() || state.is_unsafe_window() {
            error!(
                state = %state,
                kind = error.kind(),
                error = %error.display_chain(),
                "run aborted; operator attention required"
            );
        } else {
            error!(state = %state, kind = error.kind(), error = %error.display_chain(), "run aborted");
        }
        self.transition(RunState::Aborted, Some(error.kind().to_string()));
        RunOutcome::Aborted { state, error }
    }

    fn installed_tag(&self) -> Option<String> {
        self.installed.as_ref().map(|state| state.tag.to_string())
    }
}

pub struct UpdateOrchestrator<'a> {
    settings: &'a OrchestratorSettings,
    caps: Capabilities<'a>,
    observer: &'a dyn RunObserver,
}

impl<'a> UpdateOrchestrator<'a> {
    pub fn new(
        settings: &'a OrchestratorSettings,
        caps: Capabilities<'a>,
        observer: &'a dyn RunObserver,
    ) -> Self {
        Self {
            settings,
            caps,
            observer,
        }
    }

    fn manager(&self) -> InstallationManager<'a> {
        let settings = self.settings;
        InstallationManager::new(
            &settings.layout,
            self.caps.service,
            settings.directories.clone(),
        )
    }

    /// Runs one update cycle to a terminal outcome. Never panics on failure;
    /// every error is carried in the outcome.
    pub fn run(&self) -> RunOutcome {
        let layout = &self.settings.layout;
        let mut ctx = RunContext {
            run_id: String::new(),
            state: RunState::Idle,
            installed: None,
            journal: None,
            pending: Vec::new(),
            observer: self.observer,
        };

        let lock = match RunLock::try_acquire(&layout.lock_path()) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!(lock = %layout.lock_path().display(), "another run is in progress; skipping");
                let outcome = RunOutcome::Skipped;
                self.observer.on_outcome(&outcome);
                return outcome;
            }
            Err(source) => {
                let outcome = ctx.abort(UpdateError::Workspace { source });
                return self.report(&ctx, outcome);
            }
        };

        let outcome = match self.prepare(&mut ctx) {
            Ok(()) => self.execute(&mut ctx),
            Err(error) => ctx.abort(error),
        };
        self.close_journal(&mut ctx, &outcome);
        let outcome = self.report(&ctx, outcome);
        drop(lock);
        outcome
    }

    /// Every outcome except up to date is recorded, including aborts that
    /// happened before the journal was opened.
    fn close_journal(&self, ctx: &mut RunContext<'_>, outcome: &RunOutcome) {
        if matches!(outcome, RunOutcome::Skipped | RunOutcome::UpToDate { .. }) {
            return;
        }
        if let Err(err) = ctx.open_journal(&self.settings.layout) {
            warn!(error = %err, "failed to open run journal");
            return;
        }
        if let Some(journal) = &mut ctx.journal {
            let error = outcome.error().map(UpdateError::display_chain);
            if let Err(err) = journal.finish(outcome.status(), error) {
                warn!(error = %err, "failed to finalize run journal");
            }
        }
    }

    fn report(&self, ctx: &RunContext<'_>, outcome: RunOutcome) -> RunOutcome {
        info!(
            run = %ctx.run_id,
            status = outcome.status(),
            exit_code = outcome.exit_code(),
            "run finished"
        );
        self.observer.on_outcome(&outcome);
        outcome
    }

    /// Lock is held. Refuses to continue over a stale backup, then clears
    /// workspaces of runs that never finished. Writes nothing otherwise.
    fn prepare(&self, ctx: &mut RunContext<'_>) -> Result<(), UpdateError> {
        let layout = &self.settings.layout;
        ctx.run_id = new_run_id().map_err(|source| UpdateError::State { source })?;
        ctx.installed =
            read_installed_state(layout).map_err(|source| UpdateError::State { source })?;

        self.manager().check_no_stale_backups()?;

        let discarded =
            discard_stale_workspaces(layout).map_err(|source| UpdateError::Workspace { source })?;
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "recovered from an unfinished run");
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut RunContext<'_>) -> RunOutcome {
        ctx.transition(RunState::CheckingUpdate, None);
        let release = match query_latest(self.caps.registry, self.settings) {
            Ok(release) => release,
            Err(error) => return ctx.abort(error),
        };

        if let Some(installed) = &ctx.installed {
            let decision =
                decide_update(Some(&installed.tag), &release.tag, self.settings.allow_downgrade);
            if decision == UpdateDecision::DowngradeRefused {
                warn!(
                    installed = %installed.tag,
                    latest = %release.tag,
                    "latest release is older than the installed one; downgrade disabled"
                );
            }
            if decision != UpdateDecision::Install {
                let installed_tag = installed.tag.clone();
                ctx.transition(RunState::UpToDate, Some(release.tag.to_string()));
                return RunOutcome::UpToDate {
                    installed: installed_tag,
                    latest: release.tag,
                };
            }
        }

        ctx.transition(RunState::UpdateAvailable, Some(release.tag.to_string()));
        if let Err(source) = ctx.open_journal(&self.settings.layout) {
            return ctx.abort(UpdateError::State { source });
        }
        if let Err(source) = self.settings.layout.ensure_base_dirs() {
            return ctx.abort(UpdateError::Workspace { source });
        }
        if let Some(journal) = &mut ctx.journal {
            if let Err(err) = journal.set_target(release.tag.as_str()) {
                warn!(error = %err, "failed to record target tag");
            }
        }
        info!(
            installed = ctx.installed_tag().as_deref().unwrap_or("none"),
            latest = %release.tag,
            "update available"
        );

        let workspace = match StagingWorkspace::create(&self.settings.layout, &ctx.run_id) {
            Ok(workspace) => workspace,
            Err(source) => return ctx.abort(UpdateError::Workspace { source }),
        };
        self.install(ctx, &release, &workspace)
    }

    fn install(
        &self,
        ctx: &mut RunContext<'_>,
        release: &ReleaseDescriptor,
        workspace: &StagingWorkspace,
    ) -> RunOutcome {
        ctx.transition(RunState::Fetching, None);
        let fetched = match ArtifactFetcher::new(
            self.caps.store,
            &self.settings.filter,
            self.settings.companions.clone(),
        )
        .with_retry(self.settings.download_retry)
        .with_max_parallel(self.settings.max_parallel_downloads)
        .fetch(release, workspace)
        {
            Ok(fetched) => fetched,
            Err(error) => return ctx.abort(error),
        };

        ctx.transition(
            RunState::Verifying,
            Some(format!("{} assets", fetched.assets.len())),
        );
        if let Err(error) = self.verify(&fetched) {
            return ctx.abort(error);
        }

        ctx.transition(RunState::Unpacking, None);
        let staged = match stage_release(
            self.caps.unpacker,
            &release.tag,
            &fetched,
            &self.settings.directories,
            workspace,
        ) {
            Ok(staged) => staged,
            Err(error) => return ctx.abort(error),
        };

        ctx.transition(RunState::Swapping, None);
        let manager = self.manager();
        let handle = match manager.swap(&staged) {
            Ok(handle) => handle,
            Err(error) => return ctx.abort(error),
        };

        ctx.transition(RunState::HealthChecking, None);
        let gate = &self.settings.health;
        if self
            .caps
            .health
            .check(&gate.endpoint, gate.retries, gate.interval)
        {
            return match manager.promote(handle) {
                Ok(state) => {
                    ctx.transition(RunState::Promoted, Some(state.tag.to_string()));
                    RunOutcome::Promoted {
                        from: ctx.installed.as_ref().map(|installed| installed.tag.clone()),
                        to: state.tag,
                    }
                }
                Err(error) => ctx.abort(error),
            };
        }

        let cause = UpdateError::HealthCheckFailed {
            endpoint: gate.endpoint.clone(),
            attempts: gate.retries,
        };
        warn!(error = %cause, "health gate failed");
        ctx.transition(RunState::RollingBack, Some(cause.kind().to_string()));
        if let Err(error) = manager.rollback(handle) {
            return ctx.abort(error);
        }

        let prior_healthy = gate.confirm_after_rollback.then(|| {
            let healthy = self
                .caps
                .health
                .check(&gate.endpoint, gate.retries, gate.interval);
            if !healthy {
                error!(
                    endpoint = %gate.endpoint,
                    "previous installation restored but it is not reporting healthy"
                );
            }
            healthy
        });
        ctx.transition(RunState::RolledBack, None);
        RunOutcome::RolledBack {
            attempted: release.tag.clone(),
            cause,
            prior_healthy,
        }
    }

    /// Signature over the manifest first, then every asset against the
    /// manifest.
    fn verify(&self, fetched: &FetchedAssets) -> Result<(), UpdateError> {
        let manifest_bytes = fs::read(&fetched.manifest_path)
            .with_context(|| {
                format!(
                    "failed to read checksum manifest: {}",
                    fetched.manifest_path.display()
                )
            })
            .map_err(|source| UpdateError::Workspace { source })?;

        if let Some(public_key_hex) = &self.settings.public_key_hex {
            let signature_path = fetched.signature_path.as_ref().ok_or_else(|| {
                UpdateError::SignatureInvalid {
                    detail: "signature asset was not fetched".to_string(),
                }
            })?;
            let signature = fs::read_to_string(signature_path)
                .with_context(|| {
                    format!("failed to read signature: {}", signature_path.display())
                })
                .map_err(|source| UpdateError::Workspace { source })?;
            match verify_manifest_signature(&manifest_bytes, public_key_hex, &signature) {
                Ok(true) => info!("checksum manifest signature verified"),
                Ok(false) => {
                    return Err(UpdateError::SignatureInvalid {
                        detail: "signature does not match the configured public key".to_string(),
                    });
                }
                Err(err) => {
                    return Err(UpdateError::SignatureInvalid {
                        detail: format!("{err:#}"),
                    });
                }
            }
        }

        let raw = String::from_utf8(manifest_bytes).map_err(|_| UpdateError::MalformedRelease {
            detail: "checksum manifest is not valid UTF-8".to_string(),
        })?;
        let manifest = ChecksumManifest::parse(&raw)?;
        let result = ChecksumVerifier::new(self.caps.hasher).verify(&fetched.assets, &manifest)?;
        info!(
            algorithm = result.algorithm,
            assets = result.assets.len(),
            "all assets verified"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    Install,
    UpToDate,
    DowngradeRefused,
}

/// Whether `latest` should replace `installed`. Any tag change installs,
/// except a semver-older tag when downgrades are disabled.
pub fn decide_update(
    installed: Option<&VersionTag>,
    latest: &VersionTag,
    allow_downgrade: bool,
) -> UpdateDecision {
    let Some(installed) = installed else {
        return UpdateDecision::Install;
    };
    if latest == installed {
        return UpdateDecision::UpToDate;
    }
    if !allow_downgrade && latest.compare_recency(installed) == Some(Ordering::Less) {
        return UpdateDecision::DowngradeRefused;
    }
    UpdateDecision::Install
}

/// Registry query for callers that only want to know what is published.
pub fn query_latest(
    registry: &dyn RegistryClient,
    settings: &OrchestratorSettings,
) -> Result<ReleaseDescriptor, UpdateError> {
    let source = ReleaseSource::new(registry);
    settings
        .registry_retry
        .run("registry query", |_| source.get_latest(), UpdateError::is_transient)
}

