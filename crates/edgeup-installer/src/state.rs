use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use edgeup_core::VersionTag;

use crate::fs_utils::write_file_durably;
use crate::InstallLayout;

/// What is running now. Only promotion rewrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledState {
    pub tag: VersionTag,
    pub directories: Vec<String>,
    pub installed_at_unix: u64,
}

pub fn write_installed_state(layout: &InstallLayout, state: &InstalledState) -> Result<PathBuf> {
    let mut payload = String::new();
    payload.push_str(&format!("tag={}\n", state.tag));
    for directory in &state.directories {
        payload.push_str(&format!("directory={directory}\n"));
    }
    payload.push_str(&format!("installed_at_unix={}\n", state.installed_at_unix));

    let path = layout.installed_state_path();
    write_file_durably(&path, payload.as_bytes())
        .with_context(|| format!("failed to write installed state: {}", path.display()))?;
    Ok(path)
}

pub fn read_installed_state(layout: &InstallLayout) -> Result<Option<InstalledState>> {
    let path = layout.installed_state_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read installed state: {}", path.display()));
        }
    };

    let state = parse_installed_state(&raw)
        .with_context(|| format!("failed to parse installed state: {}", path.display()))?;
    Ok(Some(state))
}

pub(crate) fn parse_installed_state(raw: &str) -> Result<InstalledState> {
    let mut tag = None;
    let mut directories = Vec::new();
    let mut installed_at_unix = None;

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "tag" => tag = Some(VersionTag::parse(v)?),
            "directory" => directories.push(v.to_string()),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(InstalledState {
        tag: tag.context("missing tag")?,
        directories,
        installed_at_unix: installed_at_unix.unwrap_or(0),
    })
}
