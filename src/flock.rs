//! Exclusive database directory lock.
//!
//! One process owns a database directory at a time. The lock file holds
//! the owner's pid for debugging; the flock itself is advisory and the
//! OS releases it when the file handle closes, so a crashed process
//! never wedges the directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock, failing immediately if another process holds it.
    pub fn lock<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::Io(format!(
                "database directory is locked by another process: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> Result<()> {
        // No advisory locking on this platform; single-process use only.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// The flock releases when the file handle drops. The lock file itself is
// left in place; removing it would race a concurrent open.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("db.lock");
        let lock = FileLock::lock(&path).expect("Failed to acquire lock");

        assert_eq!(lock.path(), path.as_path());
        let content = std::fs::read_to_string(&path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_second_lock_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("db.lock");
        let _held = FileLock::lock(&path).expect("Failed to acquire lock");
        assert!(FileLock::lock(&path).is_err());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("db.lock");
        {
            let _lock = FileLock::lock(&path).expect("Failed to acquire lock");
        }
        let _relock = FileLock::lock(&path).expect("Failed to re-acquire after drop");
    }
}
