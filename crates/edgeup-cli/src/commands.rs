use std::path::Path;

use anyhow::Result;
use edgeup_core::UpdaterConfig;
use edgeup_installer::{
    latest_run, read_installed_state, InstallLayout, InstallationManager, NoopServiceController,
    RunLock, RunMetadata,
};
use edgeup_updater::{decide_update, UpdateDecision, UpdaterRuntime};
use tracing::{debug, warn};

use crate::render::{format_outcome_lines, render_status_line, OutputStyle, StateSpinner};

/// Rendered lines plus the process exit code of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandReport {
    pub(crate) lines: Vec<String>,
    pub(crate) exit_code: u8,
}

const OPERATOR_EXIT_CODE: u8 = 3;

pub(crate) fn run_update(config: &UpdaterConfig, style: OutputStyle) -> Result<CommandReport> {
    let runtime = UpdaterRuntime::from_config(config)?;
    let spinner = StateSpinner::start(style);
    let outcome = runtime.orchestrator(&spinner).run();
    Ok(CommandReport {
        lines: format_outcome_lines(&outcome, style, Some(spinner.elapsed())),
        exit_code: outcome.exit_code(),
    })
}

/// Registry query only; never touches the installation.
pub(crate) fn check_update(config: &UpdaterConfig, style: OutputStyle) -> Result<CommandReport> {
    let runtime = UpdaterRuntime::from_config(config)?;
    let installed = read_installed_state(&runtime.settings().layout)?.map(|state| state.tag);
    let latest = runtime.query_latest()?;
    debug!(installed = ?installed, latest = %latest.tag, "queried latest release");

    let mut lines = vec![
        format!(
            "installed: {}",
            installed
                .as_ref()
                .map(|tag| tag.to_string())
                .unwrap_or_else(|| "none".to_string())
        ),
        format!("latest: {}", latest.tag),
    ];
    let verdict = match decide_update(
        installed.as_ref(),
        &latest.tag,
        runtime.settings().allow_downgrade,
    ) {
        UpdateDecision::Install => render_status_line(style, "warn", "update available"),
        UpdateDecision::UpToDate => render_status_line(style, "ok", "up to date"),
        UpdateDecision::DowngradeRefused => render_status_line(
            style,
            "ok",
            "latest is older than installed; downgrade disabled",
        ),
    };
    lines.push(verdict);
    Ok(CommandReport {
        lines,
        exit_code: 0,
    })
}

pub(crate) fn show_status(config: &UpdaterConfig, style: OutputStyle) -> Result<CommandReport> {
    let layout = InstallLayout::from_config(config);
    let directories = config.managed_directories()?;
    let mut lines = Vec::new();

    match read_installed_state(&layout)? {
        Some(state) => lines.push(format!(
            "installed: {} (at unix {})",
            state.tag, state.installed_at_unix
        )),
        None => lines.push("installed: none".to_string()),
    }
    lines.push(format!("directories: {}", directories.join(", ")));

    let stale = stale_backups(&layout, directories);
    for path in &stale {
        warn!(path = %path.display(), "stale backup blocks the next run");
        lines.push(render_status_line(
            style,
            "err",
            &format!("stale backup: {}", path.display()),
        ));
    }

    match latest_run(&layout)? {
        Some(run) => lines.push(format_run_line(&run)),
        None => lines.push("last run: none".to_string()),
    }

    Ok(CommandReport {
        lines,
        exit_code: if stale.is_empty() {
            0
        } else {
            OPERATOR_EXIT_CODE
        },
    })
}

pub(crate) fn run_doctor(
    config_path: &Path,
    config: &UpdaterConfig,
    style: OutputStyle,
) -> Result<CommandReport> {
    let runtime = UpdaterRuntime::from_config(config)?;
    let settings = runtime.settings();
    let layout = &settings.layout;

    let mut lines = vec![
        format!("config: {}", config_path.display()),
        format!("install root: {}", layout.root().display()),
        format!("state dir: {}", layout.state_dir().display()),
        format!("staging: {}", layout.staging_root().display()),
        format!("registry: {}", runtime.registry().describe()),
        format!("service: {}", runtime.service().describe()),
        format!(
            "health: {} ({} attempts, {}s apart)",
            settings.health.endpoint,
            settings.health.retries,
            settings.health.interval.as_secs()
        ),
        format!(
            "signature: {}",
            if settings.public_key_hex.is_some() {
                "required (ed25519)"
            } else {
                "not configured"
            }
        ),
    ];
    for rule in &config.assets.rules {
        lines.push(format!(
            "rule: {} /{}/ -> {}",
            rule.role.as_str(),
            rule.pattern,
            rule.directory
        ));
    }

    let mut exit_code = 0;
    if layout.root().is_dir() {
        lines.push(render_status_line(style, "ok", "install root exists"));
    } else {
        lines.push(render_status_line(
            style,
            "warn",
            "install root does not exist yet; the first run creates it",
        ));
    }

    let stale = runtime.installation_manager().stale_backups();
    if stale.is_empty() {
        lines.push(render_status_line(style, "ok", "no stale backups"));
    } else {
        for path in stale {
            lines.push(render_status_line(
                style,
                "err",
                &format!("stale backup: {}", path.display()),
            ));
        }
        exit_code = OPERATOR_EXIT_CODE;
    }

    if layout.lock_path().exists() {
        if RunLock::is_held(&layout.lock_path())? {
            debug!(lock = %layout.lock_path().display(), "run lock is held");
            lines.push(render_status_line(style, "warn", "a run is in progress"));
        } else {
            lines.push(render_status_line(style, "ok", "no run in progress"));
        }
    }

    Ok(CommandReport { lines, exit_code })
}

fn stale_backups(layout: &InstallLayout, directories: Vec<String>) -> Vec<std::path::PathBuf> {
    InstallationManager::new(layout, &NoopServiceController, directories).stale_backups()
}

fn format_run_line(run: &RunMetadata) -> String {
    let mut line = format!("last run: {} {}", run.run_id, run.status);
    match (&run.from_tag, &run.to_tag) {
        (Some(from), Some(to)) => line.push_str(&format!(" ({from} -> {to})")),
        (None, Some(to)) => line.push_str(&format!(" (-> {to})")),
        _ => {}
    }
    if let Some(error) = &run.error {
        line.push_str(&format!(": {error}"));
    }
    line
}
