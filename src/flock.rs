use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive advisory lock on a store directory, held for the lifetime of the
/// value.
///
/// The lock file records the owning process id. It is left on disk after the
/// lock is released; only the OS lock matters.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock at `path` without blocking. Fails with the OS error if
    /// another handle already holds it.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        // Only rewrite the contents once the lock is ours.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = ?path, "Acquired directory lock");
        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                file.as_raw_handle() as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Releases the lock. Dropping the value does the same.
    pub fn unlock(self) -> io::Result<()> {
        tracing::debug!(path = ?self.path, "Released directory lock");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs;

    #[test]
    fn test_lock_records_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("blockkv.lock");

        let lock = FileLock::lock(&path).expect("Failed to acquire lock");
        assert_eq!(lock.path(), path.as_path());

        let content = fs::read_to_string(&path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
        lock.unlock().expect("Failed to release lock");
    }

    #[test]
    fn test_second_lock_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("blockkv.lock");

        let first = FileLock::lock(&path).expect("Failed to acquire lock");
        assert!(FileLock::lock(&path).is_err());

        // The failed attempt must not clobber the holder's pid.
        let content = fs::read_to_string(&path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
        drop(first);
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("blockkv.lock");

        {
            let _lock = FileLock::lock(&path).expect("Failed to acquire lock");
        }
        let _again = FileLock::lock(&path).expect("Lock should be free after drop");
        assert!(path.exists());
    }
}
