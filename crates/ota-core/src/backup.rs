use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::apply::ApplyError;
use crate::version::FirmwareVersion;

pub const BACKUP_INDEX_NAME: &str = ".backup-index.json";

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no backup is available to restore")]
    NoBackup,
    #[error("failed to read backup index {path}: {source}")]
    ReadIndex {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backup index {path} is corrupt: {source}")]
    CorruptIndex {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to restore {} path(s) from backup, first was {path}: {source}", failed.len())]
    Incomplete {
        failed: Vec<String>,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Snapshot of the live files one update cycle is about to replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSet {
    pub taken_at: DateTime<Utc>,
    /// Start time of the update attempt this set belongs to.
    #[serde(default)]
    pub attempt: Option<DateTime<Utc>>,
    /// Version installed when the snapshot was taken.
    pub previous_version: String,
    pub target_version: String,
    /// Relative paths that existed and were copied.
    pub saved: Vec<String>,
    /// Relative paths that did not exist and will be created by the update.
    pub created: Vec<String>,
}

impl BackupSet {
    #[must_use]
    pub fn previous_version(&self) -> Option<FirmwareVersion> {
        FirmwareVersion::parse(&self.previous_version).ok()
    }
}

pub struct BackupManager {
    live_root: PathBuf,
    backup_dir: PathBuf,
}

impl BackupManager {
    #[must_use]
    pub fn new(live_root: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            live_root,
            backup_dir,
        }
    }

    fn index_path(&self) -> PathBuf {
        self.backup_dir.join(BACKUP_INDEX_NAME)
    }

    /// Copy every existing live counterpart of `relative_paths` into the backup
    /// directory, replacing the previous cycle's snapshot.
    ///
    /// `attempt` identifies the update attempt (the flag's start time). If the
    /// current index was taken for the same attempt it is kept: a retry after
    /// a crash mid-swap would otherwise snapshot half-installed files. Paths
    /// the kept set does not cover yet are added to it.
    ///
    /// The index that makes a new set restorable is written only after every
    /// copy succeeded, so a failed backup leaves no usable set behind.
    ///
    /// # Errors
    /// Returns an error if a live file cannot be copied or the index cannot be
    /// written.
    pub fn backup(
        &self,
        relative_paths: &[String],
        previous_version: &FirmwareVersion,
        target_version: &FirmwareVersion,
        attempt: Option<DateTime<Utc>>,
    ) -> Result<BackupSet, ApplyError> {
        if let Some(started) = attempt
            && let Some(existing) = self.attempt_backup(started)
        {
            return self.extend(existing, relative_paths);
        }

        self.discard()?;

        let mut set = BackupSet {
            taken_at: Utc::now(),
            attempt,
            previous_version: previous_version.to_string(),
            target_version: target_version.to_string(),
            saved: Vec::new(),
            created: Vec::new(),
        };
        self.snapshot(&mut set, relative_paths)?;
        self.write_index(&set)?;

        info!(
            "Backed up {} file(s), {} new file(s) will be created",
            set.saved.len(),
            set.created.len()
        );
        Ok(set)
    }

    fn attempt_backup(&self, started: DateTime<Utc>) -> Option<BackupSet> {
        match self.load() {
            Ok(Some(set)) if set.attempt == Some(started) => Some(set),
            Ok(_) => None,
            Err(error) => {
                warn!("Ignoring unusable backup index: {error}");
                None
            }
        }
    }

    fn extend(
        &self,
        mut set: BackupSet,
        relative_paths: &[String],
    ) -> Result<BackupSet, ApplyError> {
        let covered = set.saved.len() + set.created.len();
        self.snapshot(&mut set, relative_paths)?;
        if set.saved.len() + set.created.len() != covered {
            self.write_index(&set)?;
        }

        info!(
            "Keeping backup taken at {} for this attempt ({} file(s))",
            set.taken_at.to_rfc3339(),
            set.saved.len()
        );
        Ok(set)
    }

    fn snapshot(
        &self,
        set: &mut BackupSet,
        relative_paths: &[String],
    ) -> Result<(), ApplyError> {
        for relative in relative_paths {
            if set.saved.contains(relative) || set.created.contains(relative) {
                continue;
            }
            let live = self.live_root.join(relative);
            match std::fs::metadata(&live) {
                Ok(metadata) if metadata.is_file() => {
                    let dest = self.backup_dir.join(relative);
                    copy_synced(&live, &dest)
                        .map_err(|error| ApplyError::backup("failed to back up", &live, error))?;
                    set.saved.push(relative.clone());
                }
                Ok(_) => {
                    return Err(ApplyError::backup(
                        "refusing to replace non-file",
                        &live,
                        std::io::Error::other("live path is not a regular file"),
                    ));
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    set.created.push(relative.clone());
                }
                Err(error) => return Err(ApplyError::backup("failed to inspect", &live, error)),
            }
        }
        Ok(())
    }

    fn write_index(&self, set: &BackupSet) -> Result<(), ApplyError> {
        let index = self.index_path();
        let data = serde_json::to_vec_pretty(set).map_err(|error| {
            ApplyError::backup("failed to encode", &index, std::io::Error::other(error))
        })?;
        ota_platform::write_atomic(&index, &data)
            .map_err(|error| ApplyError::backup("failed to write", &index, error))
    }

    /// Most recently completed backup, if any.
    ///
    /// # Errors
    /// Returns an error if the index exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<BackupSet>, RecoveryError> {
        let index = self.index_path();
        let data = match std::fs::read(&index) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RecoveryError::ReadIndex {
                    path: index.display().to_string(),
                    source,
                });
            }
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| RecoveryError::CorruptIndex {
                path: index.display().to_string(),
                source,
            })
    }

    /// Put every saved file back over the live tree and remove files the
    /// update created. Every path is attempted even after a failure.
    ///
    /// # Errors
    /// Returns an error naming the paths that could not be restored.
    pub fn restore(&self, set: &BackupSet) -> Result<(), RecoveryError> {
        let mut failed = Vec::new();
        let mut first_error: Option<(String, std::io::Error)> = None;
        let mut record = |relative: &str, error: std::io::Error| {
            warn!("Failed to restore {relative}: {error}");
            failed.push(relative.to_string());
            if first_error.is_none() {
                first_error = Some((relative.to_string(), error));
            }
        };

        for relative in &set.saved {
            let source = self.backup_dir.join(relative);
            let dest = self.live_root.join(relative);
            match copy_synced(&source, &dest) {
                Ok(()) => debug!("Restored {relative}"),
                Err(error) => record(relative, error),
            }
        }

        for relative in &set.created {
            let live = self.live_root.join(relative);
            match std::fs::remove_file(&live) {
                Ok(()) => debug!("Removed {relative}"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => record(relative, error),
            }
        }

        match first_error {
            None => {
                info!(
                    "Restored {} file(s) from backup taken at {}",
                    set.saved.len(),
                    set.taken_at.to_rfc3339()
                );
                Ok(())
            }
            Some((path, source)) => Err(RecoveryError::Incomplete {
                failed,
                path,
                source,
            }),
        }
    }

    fn discard(&self) -> Result<(), ApplyError> {
        let index = self.index_path();
        match std::fs::remove_file(&index) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(ApplyError::backup("failed to remove", &index, error)),
        }
        match std::fs::remove_dir_all(&self.backup_dir) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(ApplyError::backup("failed to clear", &self.backup_dir, error));
            }
        }
        std::fs::create_dir_all(&self.backup_dir)
            .map_err(|error| ApplyError::backup("failed to create", &self.backup_dir, error))
    }
}

fn copy_synced(source: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, dest)?;
    std::fs::File::open(dest)?.sync_all()
}
