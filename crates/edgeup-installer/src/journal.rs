use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs_utils::write_file_durably;
use crate::InstallLayout;

pub const RUN_METADATA_VERSION: u32 = 1;
pub const RUNS_TO_KEEP: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at_unix: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_unix: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Metadata plus an append-only transition log for one run.
#[derive(Debug)]
pub struct RunJournal {
    layout: InstallLayout,
    metadata: RunMetadata,
    next_seq: u64,
}

impl RunJournal {
    pub fn begin(layout: &InstallLayout, run_id: &str, from_tag: Option<String>) -> Result<Self> {
        let metadata = RunMetadata {
            version: RUN_METADATA_VERSION,
            run_id: run_id.to_string(),
            status: "running".to_string(),
            started_at_unix: current_unix_timestamp()?,
            finished_at_unix: None,
            from_tag,
            to_tag: None,
            error: None,
        };
        write_run_metadata(layout, &metadata)?;
        Ok(Self {
            layout: layout.clone(),
            metadata,
            next_seq: 1,
        })
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn record(&mut self, state: &str, detail: Option<String>) -> Result<()> {
        let entry = JournalEntry {
            seq: self.next_seq,
            state: state.to_string(),
            detail,
        };
        append_journal_entry(&self.layout, &self.metadata.run_id, &entry)?;
        self.next_seq += 1;
        Ok(())
    }

    pub fn set_target(&mut self, to_tag: &str) -> Result<()> {
        self.metadata.to_tag = Some(to_tag.to_string());
        write_run_metadata(&self.layout, &self.metadata)?;
        Ok(())
    }

    pub fn finish(&mut self, status: &str, error: Option<String>) -> Result<()> {
        self.metadata.status = status.to_string();
        self.metadata.error = error;
        self.metadata.finished_at_unix = Some(current_unix_timestamp()?);
        write_run_metadata(&self.layout, &self.metadata)?;
        Ok(())
    }
}

pub fn new_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    Ok(format!("run-{nanos}-{}", std::process::id()))
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub fn write_run_metadata(layout: &InstallLayout, metadata: &RunMetadata) -> Result<PathBuf> {
    let path = layout.run_metadata_path(&metadata.run_id);
    let mut payload =
        serde_json::to_vec_pretty(metadata).context("failed to serialize run metadata")?;
    payload.push(b'\n');
    write_file_durably(&path, &payload)
        .with_context(|| format!("failed to write run metadata file: {}", path.display()))?;
    Ok(path)
}

pub fn read_run_metadata(layout: &InstallLayout, run_id: &str) -> Result<Option<RunMetadata>> {
    let path = layout.run_metadata_path(run_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run metadata file: {}", path.display()));
        }
    };
    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing run metadata file: {}", path.display()))?;
    Ok(Some(metadata))
}

pub fn append_journal_entry(
    layout: &InstallLayout,
    run_id: &str,
    entry: &JournalEntry,
) -> Result<PathBuf> {
    let path = layout.run_journal_path(run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut line = serde_json::to_string(entry).context("failed to serialize journal entry")?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open run journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append run journal: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush run journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_journal(layout: &InstallLayout, run_id: &str) -> Result<Vec<JournalEntry>> {
    let path = layout.run_journal_path(run_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run journal: {}", path.display()));
        }
    };

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("invalid journal line {} in {}", index + 1, path.display())
            })
        })
        .collect()
}

/// All recorded runs, oldest first.
pub fn list_runs(layout: &InstallLayout) -> Result<Vec<RunMetadata>> {
    let dir = layout.runs_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut runs = Vec::new();
    for entry in
        fs::read_dir(&dir).with_context(|| format!("failed to read runs dir: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|v| v.to_str()) != Some("json") {
            continue;
        }
        let Some(run_id) = path.file_stem().and_then(|v| v.to_str()) else {
            continue;
        };
        if let Some(metadata) = read_run_metadata(layout, run_id)? {
            runs.push(metadata);
        }
    }
    runs.sort_by(|a, b| {
        a.started_at_unix
            .cmp(&b.started_at_unix)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
    Ok(runs)
}

pub fn latest_run(layout: &InstallLayout) -> Result<Option<RunMetadata>> {
    Ok(list_runs(layout)?.pop())
}

/// Deletes the records of all but the newest `keep` runs.
pub fn prune_runs(layout: &InstallLayout, keep: usize) -> Result<usize> {
    let runs = list_runs(layout)?;
    let excess = runs.len().saturating_sub(keep);
    for run in &runs[..excess] {
        for path in [
            layout.run_metadata_path(&run.run_id),
            layout.run_journal_path(&run.run_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }
    }
    Ok(excess)
}
