use std::collections::BTreeMap;

use crate::UpdateError;

/// Expected content hashes keyed by asset file name, in `sha256sum` format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, String>,
}

impl ChecksumManifest {
    pub fn parse(raw: &str) -> Result<Self, UpdateError> {
        let mut entries = BTreeMap::new();

        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = |reason: &str| UpdateError::MalformedRelease {
                detail: format!("checksum manifest line {}: {reason}", index + 1),
            };

            let (digest, rest) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| malformed("expected '<hash>  <file name>'"))?;
            // sha256sum marks binary-mode entries with a leading '*'
            let name = rest.trim_start();
            let name = name.strip_prefix('*').unwrap_or(name);
            if name.is_empty() {
                return Err(malformed("missing file name"));
            }
            if digest.len() % 2 != 0 || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
                return Err(malformed("hash is not hex encoded"));
            }

            let digest = digest.to_ascii_lowercase();
            if let Some(existing) = entries.get(name) {
                if existing != &digest {
                    return Err(malformed(&format!("conflicting entries for '{name}'")));
                }
                continue;
            }
            entries.insert(name.to_string(), digest);
        }

        Ok(Self { entries })
    }

    pub fn expected(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
