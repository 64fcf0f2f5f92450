use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use ed25519_dalek::{Signer, SigningKey};
use edgeup_core::{UpdateError, UpdaterConfig, VersionTag};
use edgeup_installer::{
    latest_run, read_installed_state, write_installed_state, ArtifactStore, CommandUnpacker,
    InstalledState, RunLock, ServiceController,
};
use edgeup_registry::{RegistryClient, RegistryDocument};
use edgeup_security::{sha256_hex, Sha256};

use super::*;

const ENDPOINT: &str = "http://127.0.0.1:8080/healthz";

fn build_test_root(nanos: u128) -> PathBuf {
    std::env::temp_dir().join(format!(
        "edgeup-updater-tests-{}-{}",
        std::process::id(),
        nanos
    ))
}

fn tag(raw: &str) -> VersionTag {
    VersionTag::parse(raw).expect("valid tag")
}

fn test_config(root: &Path) -> UpdaterConfig {
    UpdaterConfig::from_toml_str(&format!(
        r#"
[registry]
kind = "filesystem"
url = "{registry}"

[assets]
[[assets.rules]]
pattern = '^agent-linux-x86_64$'
role = "primary"
directory = "bin"
install_name = "agent"

[[assets.rules]]
pattern = '^plugin-.*\.so$'
role = "plugin"
directory = "plugins"

[install]
root = "{install}"
state_dir = "{state}"

[health]
endpoint = "{ENDPOINT}"
retries = 3
interval_secs = 5
"#,
        registry = root.join("registry").display(),
        install = root.join("opt").display(),
        state = root.join("state").display(),
    ))
    .expect("test config must parse")
}

#[derive(Default)]
struct FakeRegistry {
    body: Mutex<String>,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl RegistryClient for FakeRegistry {
    fn describe(&self) -> String {
        "fake registry".to_string()
    }

    fn fetch_latest(&self) -> anyhow::Result<RegistryDocument> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("registry unreachable"));
        }
        Ok(RegistryDocument {
            body: self.body.lock().expect("body lock").clone(),
            base: None,
        })
    }
}

#[derive(Default)]
struct FakeStore {
    files: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl ArtifactStore for FakeStore {
    fn fetch_to(&self, location: &str, destination: &Path) -> anyhow::Result<u64> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(location.to_string());
        let content = self
            .files
            .get(location)
            .ok_or_else(|| anyhow!("404 Not Found: {location}"))?;
        fs::write(destination, content)?;
        Ok(content.len() as u64)
    }
}

type ServiceHook = Box<dyn Fn() + Send + Sync>;

/// Records calls. Hooks run inside the call, so a test can disturb the
/// install root at the moment the service stops or starts.
#[derive(Default)]
struct RecordingService {
    calls: Mutex<Vec<&'static str>>,
    /// Starts beyond this many are refused.
    starts_allowed: Option<usize>,
    on_stop: Option<ServiceHook>,
    on_start: Option<ServiceHook>,
}

impl RecordingService {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ServiceController for RecordingService {
    fn describe(&self) -> String {
        "recording service".to_string()
    }

    fn start(&self) -> anyhow::Result<()> {
        let starts = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push("start");
            calls.iter().filter(|call| **call == "start").count()
        };
        if let Some(hook) = &self.on_start {
            hook();
        }
        if self.starts_allowed.is_some_and(|allowed| starts > allowed) {
            return Err(anyhow!("start refused"));
        }
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.calls.lock().expect("calls lock").push("stop");
        if let Some(hook) = &self.on_stop {
            hook();
        }
        Ok(())
    }
}

/// Answers health checks from a script; an exhausted script keeps failing.
#[derive(Default)]
struct ScriptedHealth {
    results: Mutex<VecDeque<bool>>,
    checks: AtomicU32,
    pauses: Mutex<Vec<Duration>>,
}

impl ScriptedHealth {
    fn script(&self, results: &[bool]) {
        *self.results.lock().expect("results lock") = results.iter().copied().collect();
    }

    fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().expect("pauses lock").clone()
    }
}

impl HealthProbe for ScriptedHealth {
    fn probe_once(&self, endpoint: &str) -> anyhow::Result<()> {
        assert_eq!(endpoint, ENDPOINT);
        self.checks.fetch_add(1, Ordering::SeqCst);
        let healthy = self
            .results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or(false);
        if healthy {
            Ok(())
        } else {
            Err(anyhow!("connection refused"))
        }
    }

    fn pause(&self, interval: Duration) {
        self.pauses.lock().expect("pauses lock").push(interval);
    }
}

#[derive(Default)]
struct RecordingObserver {
    transitions: Mutex<Vec<RunState>>,
    outcomes: AtomicU32,
}

impl RunObserver for RecordingObserver {
    fn on_transition(&self, _from: RunState, to: RunState) {
        self.transitions.lock().expect("transitions lock").push(to);
    }

    fn on_outcome(&self, _outcome: &RunOutcome) {
        self.outcomes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    root: PathBuf,
    settings: OrchestratorSettings,
    registry: FakeRegistry,
    store: FakeStore,
    service: RecordingService,
    health: ScriptedHealth,
    observer: RecordingObserver,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut UpdaterConfig)) -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let root = build_test_root(nanos);
        let mut config = test_config(&root);
        adjust(&mut config);
        let settings = OrchestratorSettings::from_config(&config).expect("settings must resolve");
        Self {
            root,
            settings,
            registry: FakeRegistry::default(),
            store: FakeStore::default(),
            service: RecordingService::default(),
            health: ScriptedHealth::default(),
            observer: RecordingObserver::default(),
        }
    }

    fn install_root(&self) -> &Path {
        self.settings.layout.root()
    }

    /// Publishes `tag` with a primary binary, one plugin, a README, and a
    /// manifest computed from the genuine contents. `corrupt` replaces the
    /// served bytes of one asset after the manifest is built.
    fn publish(&mut self, tag_name: &str, corrupt: Option<&str>) -> String {
        let assets = [
            ("agent-linux-x86_64", format!("agent {tag_name}")),
            ("plugin-metrics.so", format!("metrics {tag_name}")),
            ("README.md", "docs".to_string()),
        ];

        let mut manifest = String::new();
        for (name, content) in &assets[..2] {
            manifest.push_str(&format!("{}  {name}\n", sha256_hex(content.as_bytes())));
        }

        let mut entries = Vec::new();
        for (name, content) in &assets {
            let location = format!("mem://{tag_name}/{name}");
            let served = if corrupt == Some(*name) {
                format!("{content} (tampered)")
            } else {
                content.clone()
            };
            self.store.files.insert(location.clone(), served.into_bytes());
            entries.push((name.to_string(), location));
        }
        let manifest_location = format!("mem://{tag_name}/SHA256SUMS");
        self.store
            .files
            .insert(manifest_location.clone(), manifest.clone().into_bytes());
        entries.push(("SHA256SUMS".to_string(), manifest_location));

        self.set_release(tag_name, &entries);
        manifest
    }

    fn set_release(&self, tag_name: &str, entries: &[(String, String)]) {
        let assets = entries
            .iter()
            .map(|(name, location)| {
                format!(r#"{{"name": "{name}", "browser_download_url": "{location}"}}"#)
            })
            .collect::<Vec<_>>()
            .join(", ");
        *self.registry.body.lock().expect("body lock") =
            format!(r#"{{"tag_name": "{tag_name}", "assets": [{assets}]}}"#);
    }

    fn install_previous(&self, tag_name: &str) {
        let bin = self.settings.layout.active_dir("bin");
        let plugins = self.settings.layout.active_dir("plugins");
        fs::create_dir_all(&bin).expect("must create bin");
        fs::create_dir_all(&plugins).expect("must create plugins");
        fs::write(bin.join("agent"), format!("agent {tag_name}")).expect("must write agent");
        fs::write(plugins.join("plugin-metrics.so"), format!("metrics {tag_name}"))
            .expect("must write plugin");
        fs::create_dir_all(self.settings.layout.state_dir()).expect("must create state dir");
        write_installed_state(
            &self.settings.layout,
            &InstalledState {
                tag: tag(tag_name),
                directories: self.settings.directories.clone(),
                installed_at_unix: 1_700_000_000,
            },
        )
        .expect("must write installed state");
    }

    fn run(&self) -> RunOutcome {
        let caps = Capabilities {
            registry: &self.registry,
            store: &self.store,
            hasher: &Sha256,
            unpacker: &CommandUnpacker,
            service: &self.service,
            health: &self.health,
        };
        UpdateOrchestrator::new(&self.settings, caps, &self.observer).run()
    }

    fn installed_tag(&self) -> Option<VersionTag> {
        read_installed_state(&self.settings.layout)
            .expect("must read installed state")
            .map(|state| state.tag)
    }

    fn transitions(&self) -> Vec<RunState> {
        self.observer
            .transitions
            .lock()
            .expect("transitions lock")
            .clone()
    }

    fn staging_entries(&self) -> usize {
        fs::read_dir(self.settings.layout.staging_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    collect_snapshot(dir, dir, &mut out);
    out
}

fn collect_snapshot(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries {
        let path = entry.expect("must read entry").path();
        let rel = path
            .strip_prefix(base)
            .expect("entry must be under base")
            .display()
            .to_string();
        if path.is_dir() {
            out.insert(format!("{rel}/"), String::new());
            collect_snapshot(base, &path, out);
        } else {
            out.insert(rel, fs::read_to_string(&path).expect("must read file"));
        }
    }
}

#[test]
fn scenario_a_healthy_release_is_promoted() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[true]);

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Promoted { from, to } => {
            assert_eq!(from.as_ref(), Some(&tag("v1.9.0")));
            assert_eq!(to, &tag("v2.0.0"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(harness.installed_tag(), Some(tag("v2.0.0")));
    assert_eq!(
        fs::read_to_string(harness.install_root().join("bin/agent")).expect("must read agent"),
        "agent v2.0.0"
    );
    assert_eq!(
        fs::read_to_string(harness.install_root().join("plugins/plugin-metrics.so"))
            .expect("must read plugin"),
        "metrics v2.0.0"
    );
    assert!(!harness.settings.layout.backup_dir("bin").exists());
    assert!(!harness.settings.layout.backup_dir("plugins").exists());
    assert_eq!(harness.staging_entries(), 0);
    assert_eq!(harness.service.calls(), vec!["stop", "start"]);
    assert_eq!(
        harness.transitions(),
        vec![
            RunState::CheckingUpdate,
            RunState::UpdateAvailable,
            RunState::Fetching,
            RunState::Verifying,
            RunState::Unpacking,
            RunState::Swapping,
            RunState::HealthChecking,
            RunState::Promoted,
        ]
    );
    assert!(!harness
        .store
        .requests
        .lock()
        .expect("requests lock")
        .iter()
        .any(|location| location.ends_with("README.md")));

    let run = latest_run(&harness.settings.layout)
        .expect("must list runs")
        .expect("run must be recorded");
    assert_eq!(run.status, "promoted");
    assert_eq!(run.from_tag.as_deref(), Some("v1.9.0"));
    assert_eq!(run.to_tag.as_deref(), Some("v2.0.0"));
}

#[test]
fn scenario_b_one_bad_plugin_hash_blocks_the_release() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", Some("plugin-metrics.so"));
    let before = snapshot(harness.install_root());

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::Verifying);
            assert!(
                matches!(error, UpdateError::ChecksumMismatch { name, .. } if name == "plugin-metrics.so")
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 2);
    assert!(!outcome.is_success());
    assert_eq!(harness.installed_tag(), Some(tag("v1.9.0")));
    assert!(harness.service.calls().is_empty());
    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 0);
    assert_eq!(snapshot(harness.install_root()), before);
    assert_eq!(harness.staging_entries(), 0);
}

#[test]
fn scenario_c_failed_health_gate_rolls_back() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[false, false, false, true]);
    let before = snapshot(harness.install_root());

    let outcome = harness.run();

    match &outcome {
        RunOutcome::RolledBack {
            attempted,
            cause,
            prior_healthy,
        } => {
            assert_eq!(attempted, &tag("v2.0.0"));
            assert!(matches!(cause, UpdateError::HealthCheckFailed { attempts: 3, .. }));
            assert_eq!(*prior_healthy, Some(true));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(harness.installed_tag(), Some(tag("v1.9.0")));
    assert_eq!(snapshot(harness.install_root()), before);
    assert_eq!(harness.service.calls(), vec!["stop", "start", "stop", "start"]);
    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 4);
    assert_eq!(
        harness.health.pauses(),
        vec![Duration::from_secs(5), Duration::from_secs(5)]
    );
    assert_eq!(
        harness.transitions()[6..],
        [
            RunState::HealthChecking,
            RunState::RollingBack,
            RunState::RolledBack
        ]
    );
}

#[test]
fn rollback_reports_unhealthy_prior_release_without_changing_outcome() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[]);

    let outcome = harness.run();

    assert!(matches!(
        outcome,
        RunOutcome::RolledBack {
            prior_healthy: Some(false),
            ..
        }
    ));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 6);
}

#[test]
fn rollback_confirmation_can_be_disabled() {
    let mut harness = Harness::with_config(|config| config.health.confirm_after_rollback = false);
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);

    let outcome = harness.run();

    assert!(matches!(
        outcome,
        RunOutcome::RolledBack {
            prior_healthy: None,
            ..
        }
    ));
    assert_eq!(harness.health.checks.load(Ordering::SeqCst), 3);
}

#[test]
fn equal_tag_is_a_no_op() {
    let mut harness = Harness::new();
    harness.install_previous("v2.0.0");
    harness.publish("v2.0.0", None);
    let before = snapshot(harness.install_root());

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::UpToDate { .. }));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(snapshot(harness.install_root()), before);
    assert!(harness.service.calls().is_empty());
    assert!(harness
        .store
        .requests
        .lock()
        .expect("requests lock")
        .is_empty());
    assert_eq!(harness.staging_entries(), 0);
    assert_eq!(
        harness.transitions(),
        vec![RunState::CheckingUpdate, RunState::UpToDate]
    );
}

#[test]
fn up_to_date_run_with_default_state_dir_writes_only_the_lock() {
    let mut harness = Harness::with_config(|config| config.install.state_dir = None);
    harness.install_previous("v2.0.0");
    harness.publish("v2.0.0", None);
    let before = snapshot(harness.install_root());
    assert!(before.contains_key(".edgeup/"));

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::UpToDate { .. }));
    let mut after = snapshot(harness.install_root());
    assert!(after.remove(".edgeup/run.lock").is_some());
    assert_eq!(after, before);
    assert!(!harness.settings.layout.runs_dir().exists());
    assert!(!harness.settings.layout.staging_root().exists());
    assert!(latest_run(&harness.settings.layout)
        .expect("must list runs")
        .is_none());
}

#[test]
fn abort_before_update_available_is_still_journaled() {
    let mut harness = Harness::with_config(|config| config.install.state_dir = None);
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.registry.failures_left.store(1, Ordering::SeqCst);

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::Aborted { .. }));
    let run = latest_run(&harness.settings.layout)
        .expect("must list runs")
        .expect("aborted run must be recorded");
    assert_eq!(run.status, "aborted");
    assert_eq!(run.from_tag.as_deref(), Some("v1.9.0"));
    assert!(run.error.is_some());
}

#[test]
fn older_release_is_ignored_when_downgrade_is_disabled() {
    let mut harness = Harness::with_config(|config| config.policy.allow_downgrade = false);
    harness.install_previous("v2.1.0");
    harness.publish("v2.0.0", None);

    let outcome = harness.run();

    match outcome {
        RunOutcome::UpToDate { installed, latest } => {
            assert_eq!(installed, tag("v2.1.0"));
            assert_eq!(latest, tag("v2.0.0"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(harness.service.calls().is_empty());
}

#[test]
fn older_release_is_installed_when_downgrade_is_allowed() {
    let mut harness = Harness::new();
    harness.install_previous("v2.1.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[true]);

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::Promoted { .. }));
    assert_eq!(harness.installed_tag(), Some(tag("v2.0.0")));
}

#[test]
fn first_install_without_previous_state_is_promoted() {
    let mut harness = Harness::new();
    harness.publish("v1.0.0", None);
    harness.health.script(&[true]);

    let outcome = harness.run();

    match outcome {
        RunOutcome::Promoted { from, to } => {
            assert_eq!(from, None);
            assert_eq!(to, tag("v1.0.0"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        fs::read_to_string(harness.install_root().join("bin/agent")).expect("must read agent"),
        "agent v1.0.0"
    );
}

#[test]
fn stale_backup_halts_run_before_any_cleanup() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    let backup = harness.settings.layout.backup_dir("bin");
    fs::create_dir_all(&backup).expect("must create stale backup");
    let leftover = harness.settings.layout.staging_path("run-crashed");
    fs::create_dir_all(&leftover).expect("must create leftover workspace");

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::Idle);
            assert!(matches!(error, UpdateError::StaleBackup { path } if *path == backup));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 3);
    assert!(outcome.requires_operator());
    assert!(backup.exists());
    assert!(leftover.exists());
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 0);
    assert!(harness.service.calls().is_empty());
}

#[test]
fn workspace_left_by_crashed_run_is_discarded() {
    let mut harness = Harness::new();
    harness.install_previous("v2.0.0");
    harness.publish("v2.0.0", None);
    let leftover = harness.settings.layout.staging_path("run-crashed");
    fs::create_dir_all(leftover.join("downloads")).expect("must create leftover workspace");
    fs::write(leftover.join("downloads/agent.part"), b"partial").expect("must write partial");

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::UpToDate { .. }));
    assert!(!leftover.exists());
}

#[test]
fn concurrent_trigger_is_skipped() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    let held = RunLock::try_acquire(&harness.settings.layout.lock_path())
        .expect("lock must open")
        .expect("lock must be free");

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::Skipped));
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.installed_tag(), Some(tag("v1.9.0")));
    assert_eq!(harness.observer.outcomes.load(Ordering::SeqCst), 1);
    drop(held);
}

#[test]
fn registry_failures_are_retried_within_budget() {
    let mut harness = Harness::with_config(|config| {
        config.retry.registry_attempts = 2;
        config.retry.backoff_ms = 0;
    });
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[true]);
    harness.registry.failures_left.store(1, Ordering::SeqCst);

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::Promoted { .. }));
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn registry_failure_without_retry_aborts_without_mutation() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.registry.failures_left.store(1, Ordering::SeqCst);
    let before = snapshot(harness.install_root());

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::CheckingUpdate);
            assert!(matches!(error, UpdateError::Registry { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 1);
    assert_eq!(snapshot(harness.install_root()), before);
}

#[test]
fn malformed_release_is_not_retried() {
    let harness = Harness::with_config(|config| config.retry.registry_attempts = 3);
    *harness.registry.body.lock().expect("body lock") = r#"{"tag_name": ""}"#.to_string();

    let outcome = harness.run();

    assert!(matches!(
        outcome,
        RunOutcome::Aborted {
            error: UpdateError::MalformedRelease { .. },
            ..
        }
    ));
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_primary_asset_aborts_during_fetch() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.set_release(
        "v2.0.0",
        &[(
            "SHA256SUMS".to_string(),
            "mem://v2.0.0/SHA256SUMS".to_string(),
        )],
    );

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::Fetching);
            assert!(matches!(error, UpdateError::AssetMissing { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(harness.service.calls().is_empty());
    assert_eq!(harness.staging_entries(), 0);
}

#[test]
fn signed_manifest_is_checked_when_key_is_configured() {
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());

    let mut harness = Harness::with_config(|config| {
        config.assets.public_key_hex = Some(public_key_hex.clone());
    });
    harness.install_previous("v1.9.0");
    let manifest = harness.publish("v2.0.0", None);
    let signature = hex::encode(signing_key.sign(manifest.as_bytes()).to_bytes());
    harness.store.files.insert(
        "mem://v2.0.0/SHA256SUMS.sig".to_string(),
        format!("{signature}\n").into_bytes(),
    );
    let mut entries = ["agent-linux-x86_64", "plugin-metrics.so", "SHA256SUMS", "SHA256SUMS.sig"]
        .iter()
        .map(|name| (name.to_string(), format!("mem://v2.0.0/{name}")))
        .collect::<Vec<_>>();
    harness.set_release("v2.0.0", &entries);
    harness.health.script(&[true]);

    let outcome = harness.run();
    assert!(matches!(outcome, RunOutcome::Promoted { .. }));

    let other_key = SigningKey::from_bytes(&[9u8; 32]);
    let forged = hex::encode(other_key.sign(manifest.as_bytes()).to_bytes());
    harness
        .store
        .files
        .insert("mem://v3.0.0/SHA256SUMS.sig".to_string(), forged.into_bytes());
    harness.store.files.insert(
        "mem://v3.0.0/SHA256SUMS".to_string(),
        manifest.clone().into_bytes(),
    );
    for name in ["agent-linux-x86_64", "plugin-metrics.so"] {
        let content = harness
            .store
            .files
            .get(&format!("mem://v2.0.0/{name}"))
            .cloned()
            .expect("published asset");
        harness
            .store
            .files
            .insert(format!("mem://v3.0.0/{name}"), content);
    }
    entries = ["agent-linux-x86_64", "plugin-metrics.so", "SHA256SUMS", "SHA256SUMS.sig"]
        .iter()
        .map(|name| (name.to_string(), format!("mem://v3.0.0/{name}")))
        .collect();
    harness.set_release("v3.0.0", &entries);

    let outcome = harness.run();
    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::Verifying);
            assert!(matches!(error, UpdateError::SignatureInvalid { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(harness.installed_tag(), Some(tag("v2.0.0")));
}

#[test]
fn parallel_downloads_reach_the_same_result() {
    let mut harness = Harness::with_config(|config| config.retry.max_parallel_downloads = 4);
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[true]);

    let outcome = harness.run();

    assert!(matches!(outcome, RunOutcome::Promoted { .. }));
    assert_eq!(
        harness
            .store
            .requests
            .lock()
            .expect("requests lock")
            .len(),
        3
    );
}

#[test]
fn swap_that_cannot_be_undone_aborts_for_operator() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    let rejected = harness.settings.layout.rejected_dir("bin");
    let blocker = harness.settings.layout.backup_dir("plugins");
    harness.service.on_stop = Some(Box::new(move || {
        fs::write(&rejected, b"leftover").expect("must write leftover");
        fs::create_dir_all(&blocker).expect("must create blocker");
        fs::write(blocker.join("keep"), b"x").expect("must fill blocker");
    }));

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::Swapping);
            assert!(matches!(error, UpdateError::Swap { restored: false, .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 3);
    assert!(outcome.requires_operator());
    assert_eq!(harness.installed_tag(), Some(tag("v1.9.0")));
    assert_eq!(
        fs::read_to_string(harness.settings.layout.backup_dir("bin").join("agent"))
            .expect("previous tree must survive as backup"),
        "agent v1.9.0"
    );
    assert_eq!(
        harness.transitions().last(),
        Some(&RunState::Aborted)
    );
    let run = latest_run(&harness.settings.layout)
        .expect("must list runs")
        .expect("run must be recorded");
    assert_eq!(run.status, "aborted");
}

#[test]
fn rollback_that_cannot_start_the_service_aborts_for_operator() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.service.starts_allowed = Some(1);

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::RollingBack);
            assert!(matches!(error, UpdateError::RollbackFailed { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(harness.installed_tag(), Some(tag("v1.9.0")));
    assert_eq!(
        fs::read_to_string(harness.install_root().join("bin/agent")).expect("must read agent"),
        "agent v1.9.0"
    );
    assert_eq!(harness.service.calls(), vec!["stop", "start", "stop", "start"]);
    assert_eq!(
        harness.transitions().last(),
        Some(&RunState::Aborted)
    );
}

#[test]
fn promote_failure_after_healthy_gate_aborts_for_operator() {
    let mut harness = Harness::new();
    harness.install_previous("v1.9.0");
    harness.publish("v2.0.0", None);
    harness.health.script(&[true]);
    let backup = harness.settings.layout.backup_dir("bin");
    harness.service.on_start = Some(Box::new(move || {
        let _ = fs::remove_dir_all(&backup);
    }));

    let outcome = harness.run();

    match &outcome {
        RunOutcome::Aborted { state, error } => {
            assert_eq!(*state, RunState::HealthChecking);
            assert!(matches!(error, UpdateError::Promote { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(harness.installed_tag(), Some(tag("v1.9.0")));
    assert!(!harness
        .transitions()
        .contains(&RunState::Promoted));
    let run = latest_run(&harness.settings.layout)
        .expect("must list runs")
        .expect("run must be recorded");
    assert_eq!(run.status, "aborted");
    assert_eq!(run.to_tag.as_deref(), Some("v2.0.0"));
}

#[test]
fn outcome_exit_codes_follow_result_contract() {
    assert_eq!(RunOutcome::Skipped.exit_code(), 0);
    assert_eq!(
        RunOutcome::Aborted {
            state: RunState::Swapping,
            error: UpdateError::Swap {
                restored: false,
                source: anyhow!("rename failed"),
            },
        }
        .exit_code(),
        3
    );
    assert_eq!(
        RunOutcome::Aborted {
            state: RunState::Swapping,
            error: UpdateError::Swap {
                restored: true,
                source: anyhow!("rename failed"),
            },
        }
        .exit_code(),
        2
    );
    assert_eq!(
        RunOutcome::Aborted {
            state: RunState::RollingBack,
            error: UpdateError::RollbackFailed {
                source: anyhow!("restore failed"),
            },
        }
        .exit_code(),
        3
    );
    assert!(RunState::Swapping.is_unsafe_window());
    assert!(!RunState::Fetching.is_terminal());
    assert!(RunState::RolledBack.is_terminal());
}

#[test]
fn health_check_stops_at_first_success() {
    let health = ScriptedHealth::default();
    health.script(&[false, true]);

    assert!(health.check(ENDPOINT, 5, Duration::from_secs(2)));
    assert_eq!(health.checks.load(Ordering::SeqCst), 2);
    assert_eq!(health.pauses(), vec![Duration::from_secs(2)]);
}

#[test]
fn http_health_check_treats_refused_connection_as_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind");
    let address = listener.local_addr().expect("must read address");
    drop(listener);

    let checker = HttpHealthProbe::new(Duration::from_millis(500)).expect("must build health client");
    let endpoint = format!("http://{address}/healthz");
    assert!(checker.probe_once(&endpoint).is_err());
}

#[test]
fn http_health_check_accepts_success_status() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind");
    let address = listener.local_addr().expect("must read address");
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept health request");
        let mut buffer = [0_u8; 1024];
        let _ = std::io::Read::read(&mut stream, &mut buffer);
        std::io::Write::write_all(
            &mut stream,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .expect("must write response");
    });

    let checker = HttpHealthProbe::new(Duration::from_secs(2)).expect("must build health client");
    checker
        .probe_once(&format!("http://{address}/healthz"))
        .expect("200 must pass");
    server.join().expect("server thread must join");
}

#[test]
fn update_decision_respects_downgrade_policy() {
    let installed = tag("v2.1.0");
    assert_eq!(
        decide_update(None, &tag("v1.0.0"), false),
        UpdateDecision::Install
    );
    assert_eq!(
        decide_update(Some(&installed), &tag("v2.1.0"), false),
        UpdateDecision::UpToDate
    );
    assert_eq!(
        decide_update(Some(&installed), &tag("v2.0.0"), false),
        UpdateDecision::DowngradeRefused
    );
    assert_eq!(
        decide_update(Some(&installed), &tag("v2.0.0"), true),
        UpdateDecision::Install
    );
    assert_eq!(
        decide_update(Some(&installed), &tag("nightly-42"), false),
        UpdateDecision::Install
    );
}
