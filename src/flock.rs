use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// An advisory exclusive lock on a file, cooperating with other processes
/// that use the same protocol. The lock is held for the lifetime of the
/// value and released when it is dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if necessary and acquires the lock. The process
    /// ID is written into the file for debugging. Fails with
    /// `ErrorKind::WouldBlock` if another process holds the lock.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        // The file must not be truncated before the lock is acquired, since
        // a different process may hold it and have written its pid.
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;

        Self::try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    // Other platforms fall back to a no-op, which allows compilation but
    // provides no mutual exclusion.
    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Releases the lock. The lock file is left in place to avoid races with
    /// other processes acquiring it concurrently.
    pub fn unlock(self) -> io::Result<()> {
        Ok(())
    }

    /// The path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle is closed.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_writes_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.lock");

        let lock = FileLock::lock(&path).expect("failed to acquire lock");
        assert!(path.exists());
        let content = std::fs::read_to_string(&path).expect("read lock file");
        assert!(content.contains(&std::process::id().to_string()));

        lock.unlock().expect("failed to release lock");
    }

    #[test]
    fn second_lock_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.lock");

        let _lock1 = FileLock::lock(&path).expect("failed to acquire first lock");
        let lock2 = FileLock::lock(&path);
        assert!(lock2.is_err());
    }

    #[test]
    fn relock_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.lock");

        {
            let _lock = FileLock::lock(&path).expect("failed to acquire lock");
            assert!(path.exists());
        }

        // The file remains, but the lock is free again.
        let _lock2 = FileLock::lock(&path).expect("failed to reacquire lock after drop");
    }
}
