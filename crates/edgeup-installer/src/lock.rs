use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Advisory lock held for the whole of one run. The OS releases it if the
/// process dies.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Returns `None` when another run holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open run lock: {}", path.display()))?;

        if !try_lock_exclusive(path, &file)
            .with_context(|| format!("failed to lock {}", path.display()))?
        {
            return Ok(None);
        }

        let mut lock = Self {
            path: path.to_path_buf(),
            file,
        };
        lock.record_owner()?;
        Ok(Some(lock))
    }

    /// Reports whether some run holds the lock at `path` without taking it
    /// or touching the recorded owner. A missing lock file is free.
    pub fn is_held(path: &Path) -> Result<bool> {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open run lock: {}", path.display()))
            }
        };
        lock_is_held(path, &file).with_context(|| format!("failed to inspect {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_owner(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .with_context(|| format!("failed to truncate run lock: {}", self.path.display()))?;
        writeln!(self.file, "pid={}", std::process::id())
            .with_context(|| format!("failed to write run lock: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for RunLock {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;

        let _ = self.file.set_len(0);
        // SAFETY: the descriptor is owned by `self.file` and still open.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.with_extension("held"));
    }
}

#[cfg(unix)]
fn try_lock_exclusive(_path: &Path, file: &File) -> std::io::Result<bool> {
    use std::os::fd::AsRawFd;

    // SAFETY: flock only reads the descriptor, which `file` keeps open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

#[cfg(unix)]
fn lock_is_held(_path: &Path, file: &File) -> std::io::Result<bool> {
    use std::os::fd::AsRawFd;

    // SAFETY: flock only reads the descriptor, which `file` keeps open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        // SAFETY: as above; releases the lock taken just now.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        return Ok(false);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(true);
    }
    Err(err)
}

#[cfg(not(unix))]
fn lock_is_held(path: &Path, _file: &File) -> std::io::Result<bool> {
    Ok(path.with_extension("held").exists())
}

#[cfg(not(unix))]
fn try_lock_exclusive(path: &Path, _file: &File) -> std::io::Result<bool> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path.with_extension("held"))
    {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}
