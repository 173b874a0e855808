use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("another update engine is already running on this device root")]
    AlreadyRunning,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl AcquireError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive advisory lock held for the life of the process.
pub struct SingleInstance {
    _file: File,
}

impl SingleInstance {
    /// Lock `lock_file_path`, recording our pid in it.
    ///
    /// # Errors
    /// Returns [`AcquireError::AlreadyRunning`] if another process holds the
    /// lock, or an I/O error if the lock file cannot be used.
    pub fn acquire(lock_file_path: &Path) -> Result<Self, AcquireError> {
        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_file_path)
            .map_err(|error| AcquireError::io("failed to open instance lock file", error))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(AcquireError::AlreadyRunning);
            }
            Err(error) => {
                return Err(AcquireError::io("failed to acquire instance lock", error));
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| AcquireError::io("failed to write instance lock metadata", error))?;

        Ok(Self { _file: lock_file })
    }
}

#[cfg(test)]
mod tests {
    use super::{AcquireError, SingleInstance};

    #[test]
    fn second_acquire_reports_already_running() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let lock_path = temp_dir.path().join(".ota.lock");

        let first = SingleInstance::acquire(&lock_path).expect("first acquire should succeed");
        assert!(matches!(
            SingleInstance::acquire(&lock_path),
            Err(AcquireError::AlreadyRunning)
        ));

        drop(first);
        assert!(SingleInstance::acquire(&lock_path).is_ok());
    }

    #[test]
    fn lock_file_records_pid() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let lock_path = temp_dir.path().join(".ota.lock");

        let _guard = SingleInstance::acquire(&lock_path).expect("acquire should succeed");
        let contents = std::fs::read_to_string(&lock_path).expect("lock file should be readable");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
