use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256 as Sha256Hasher};

/// Content hash used to compare downloaded files against a checksum manifest.
pub trait HashAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lowercase hex digest of the file at `path`.
    fn hash_file(&self, path: &Path) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256;

impl HashAlgorithm for Sha256 {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn hash_file(&self, path: &Path) -> Result<String> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        sha256_reader_hex(BufReader::new(file))
            .with_context(|| format!("failed to hash {}", path.display()))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256Hasher::digest(bytes))
}

pub fn sha256_reader_hex(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256Hasher::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).context("failed to read hash input")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
