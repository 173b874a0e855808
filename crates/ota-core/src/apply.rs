use std::path::Path;

use log::{debug, error, info, warn};
use ota_platform::{DevicePaths, ResetPrimitive};
use thiserror::Error;

use crate::backup::{BackupManager, BackupSet, RecoveryError};
use crate::manifest::IntegrityManifest;
use crate::state::UpdateStateStore;
use crate::version::FirmwareVersion;
use crate::version_record::VersionRecord;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("refusing to install over reserved path {path}")]
    ReservedPath { path: String },
    #[error("{context} {path}: {source}")]
    Backup {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to move {path} into place: {source}")]
    Swap {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write version record: {0}")]
    VersionRecord(#[source] std::io::Error),
    #[error("rollback after '{cause}' did not complete: {source}")]
    RollbackFailed {
        cause: String,
        #[source]
        source: RecoveryError,
    },
}

impl ApplyError {
    pub(crate) fn backup(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Backup {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Moves verified staged files over the live tree and restarts the device.
pub struct UpdateApplier<'a> {
    live_root: &'a Path,
    backup: &'a BackupManager,
    version_record: &'a VersionRecord,
    state: &'a UpdateStateStore,
    reset: &'a dyn ResetPrimitive,
}

impl<'a> UpdateApplier<'a> {
    #[must_use]
    pub fn new(
        live_root: &'a Path,
        backup: &'a BackupManager,
        version_record: &'a VersionRecord,
        state: &'a UpdateStateStore,
        reset: &'a dyn ResetPrimitive,
    ) -> Self {
        Self {
            live_root,
            backup,
            version_record,
            state,
            reset,
        }
    }

    /// Back up, swap file by file, record `target` and reset.
    ///
    /// Any failure after the backup restores the live tree before returning,
    /// leaving the update flag in place.
    ///
    /// # Errors
    /// Returns an error if a target is reserved, the backup fails, a file
    /// cannot be moved into place, or the version record cannot be written.
    pub fn apply(
        &self,
        staging_dir: &Path,
        manifest: &IntegrityManifest,
        installed: &FirmwareVersion,
        target: &FirmwareVersion,
    ) -> Result<(), ApplyError> {
        let targets: Vec<String> = manifest.paths().map(str::to_string).collect();
        check_reserved(&targets)?;

        let attempt = match self.state.load() {
            Ok(state) => state.started_at,
            Err(error) => {
                warn!("Cannot read update flag, taking a fresh backup: {error}");
                None
            }
        };
        let set = self.backup.backup(&targets, installed, target, attempt)?;

        for relative in &targets {
            let staged = staging_dir.join(relative);
            let live = self.live_root.join(relative);
            if let Err(source) = move_file(&staged, &live) {
                let cause = ApplyError::Swap {
                    path: relative.clone(),
                    source,
                };
                return Err(self.roll_back(&set, cause));
            }
            debug!("Installed {relative}");
        }

        if let Err(source) = self.version_record.write(target) {
            return Err(self.roll_back(&set, ApplyError::VersionRecord(source)));
        }
        info!("Firmware {installed} -> {target} applied, {} file(s)", targets.len());

        if let Err(error) = self.state.clear() {
            warn!("Failed to clear update flag: {error}");
        }
        if let Err(error) = std::fs::remove_dir_all(staging_dir) {
            warn!("Failed to clean staging directory: {error}");
        }

        self.reset.reset();
        Ok(())
    }

    fn roll_back(&self, set: &BackupSet, cause: ApplyError) -> ApplyError {
        warn!("Apply failed, restoring backup: {cause}");
        match self.backup.restore(set) {
            Ok(()) => cause,
            Err(source) => {
                error!("Rollback failed: {source}");
                ApplyError::RollbackFailed {
                    cause: cause.to_string(),
                    source,
                }
            }
        }
    }
}

fn check_reserved(targets: &[String]) -> Result<(), ApplyError> {
    let reserved = DevicePaths::reserved_names();
    for relative in targets {
        let first = relative.split('/').next().unwrap_or(relative);
        if reserved.contains(&first) {
            return Err(ApplyError::ReservedPath {
                path: relative.clone(),
            });
        }
    }
    Ok(())
}

fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }

    std::fs::copy(src, dest)?;
    std::fs::File::open(dest)?.sync_all()?;
    std::fs::remove_file(src)
}
