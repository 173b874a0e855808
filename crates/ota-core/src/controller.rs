//! Once-per-boot update state machine.
//!
//! The flag file is the only state carried across resets:
//! - No flag: check for a newer release; create the flag just before the
//!   first attempt.
//! - Flag present: the previous boot died or failed mid-attempt. Bump the
//!   counter, then retry from scratch, or restore the last backup once the
//!   counter reaches [`ATTEMPT_THRESHOLD`].

use std::fmt;

use log::{error, info, warn};
use ota_platform::{ConfigStore, DevicePaths, NetworkManager, ResetPrimitive};
use serde_json::Value;

use crate::apply::UpdateApplier;
use crate::archive::ArchiveInstaller;
use crate::backup::{BackupManager, RecoveryError};
use crate::download::Downloader;
use crate::error::UpdateError;
use crate::release::{ReleaseMetadata, ReleaseResolver, is_update_needed, select_asset};
use crate::settings::{KEY_UPDATE_ON_BOOT, SECTION_SYS_FIRMWARE, UpdateSettings};
use crate::state::{ATTEMPT_THRESHOLD, UpdatePhase, UpdateStateStore};
use crate::transport::HttpTransport;
use crate::version::FirmwareVersion;
use crate::version_record::VersionRecord;

/// Capabilities one boot runs against.
#[derive(Clone, Copy)]
pub struct UpdateContext<'a> {
    pub paths: &'a DevicePaths,
    pub config: &'a dyn ConfigStore,
    pub network: &'a dyn NetworkManager,
    pub transport: &'a dyn HttpTransport,
    pub reset: &'a dyn ResetPrimitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Idle,
    Checking,
    Updating { attempt: u32 },
    ForcedRestore,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Checking => write!(f, "Checking"),
            Self::Updating { attempt } => write!(f, "Updating({attempt})"),
            Self::ForcedRestore => write!(f, "ForcedRestore"),
        }
    }
}

/// What one boot did.
#[derive(Debug)]
pub enum BootOutcome {
    /// Update on boot is disabled and nothing is pending.
    Idle,
    UpToDate {
        installed: FirmwareVersion,
        latest: FirmwareVersion,
    },
    Updated {
        from: FirmwareVersion,
        to: FirmwareVersion,
    },
    /// `attempt` is `None` when the check failed before an attempt began.
    AttemptFailed {
        attempt: Option<u32>,
        error: UpdateError,
    },
    Restored,
    RecoveryFailed(RecoveryError),
    Skipped {
        reason: &'static str,
    },
    NetworkUnavailable,
}

impl fmt::Display for BootOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle, update on boot disabled"),
            Self::UpToDate { installed, latest } => {
                write!(f, "up to date ({installed}, latest {latest})")
            }
            Self::Updated { from, to } => write!(f, "updated {from} -> {to}"),
            Self::AttemptFailed {
                attempt: Some(attempt),
                error,
            } => write!(f, "attempt {attempt} failed ({}): {error}", error.kind()),
            Self::AttemptFailed {
                attempt: None,
                error,
            } => write!(f, "update check failed ({}): {error}", error.kind()),
            Self::Restored => write!(f, "restored from backup"),
            Self::RecoveryFailed(error) => write!(f, "restore from backup failed: {error}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::NetworkUnavailable => write!(f, "network unavailable"),
        }
    }
}

pub struct BootRecoveryController<'a> {
    ctx: UpdateContext<'a>,
    settings: UpdateSettings,
    state_store: UpdateStateStore,
    version_record: VersionRecord,
    backup: BackupManager,
    state: BootState,
}

impl<'a> BootRecoveryController<'a> {
    #[must_use]
    pub fn new(ctx: UpdateContext<'a>) -> Self {
        let settings = UpdateSettings::from_config(ctx.config);
        Self::with_settings(ctx, settings)
    }

    #[must_use]
    pub fn with_settings(ctx: UpdateContext<'a>, settings: UpdateSettings) -> Self {
        Self {
            state_store: UpdateStateStore::new(ctx.paths.flag_file()),
            version_record: VersionRecord::new(ctx.paths.version_file()),
            backup: BackupManager::new(ctx.paths.live_root().to_path_buf(), ctx.paths.backup_dir()),
            settings,
            ctx,
            state: BootState::Idle,
        }
    }

    #[must_use]
    pub fn state(&self) -> BootState {
        self.state
    }

    fn transition(&mut self, next: BootState) {
        if self.state != next {
            info!("Boot state {} -> {next}", self.state);
            self.state = next;
        }
    }

    /// Run the boot sequence once.
    ///
    /// A successful update or restore triggers the reset primitive before
    /// returning; on a real device that call does not return.
    pub async fn run(&mut self) -> BootOutcome {
        let current = match self.state_store.load() {
            Ok(current) => current,
            Err(error) => {
                error!("Cannot read update flag: {error}");
                return BootOutcome::AttemptFailed {
                    attempt: None,
                    error: error.into(),
                };
            }
        };
        let pending = current.phase == UpdatePhase::InProgress;

        if pending && current.attempt_counter >= ATTEMPT_THRESHOLD {
            return self.forced_restore(current.attempt_counter);
        }

        if !self.settings.update_on_boot {
            if pending {
                info!(
                    "Update on boot is disabled, leaving pending attempt {} untouched",
                    current.attempt_counter
                );
                return BootOutcome::Skipped {
                    reason: "update on boot disabled",
                };
            }
            info!("Update on boot is disabled");
            return BootOutcome::Idle;
        }

        let Some(endpoint) = self.settings.endpoint.clone() else {
            warn!("No firmware release endpoint configured, skipping update check");
            return BootOutcome::Skipped {
                reason: "no release endpoint configured",
            };
        };

        let attempt = if pending {
            let next = match self.state_store.increment() {
                Ok(next) => next,
                Err(error) => {
                    error!("Cannot update the attempt counter: {error}");
                    return BootOutcome::AttemptFailed {
                        attempt: Some(current.attempt_counter),
                        error: error.into(),
                    };
                }
            };
            if next >= ATTEMPT_THRESHOLD {
                return self.forced_restore(next);
            }
            warn!(
                "Previous update did not complete, retrying (attempt {}/{ATTEMPT_THRESHOLD})",
                next + 1
            );
            Some(next)
        } else {
            None
        };

        self.ctx.network.up();
        if !self
            .ctx
            .network
            .wait_until_up(self.settings.network_timeout)
            .await
        {
            warn!("Network unavailable, continuing boot without an update check");
            return BootOutcome::NetworkUnavailable;
        }
        if let Some(ip) = self.ctx.network.ip_address() {
            info!("Network connected, IP: {ip}");
        }

        self.transition(BootState::Checking);
        let installed = self.version_record.read();
        info!("Installed firmware version: {installed}");

        let resolver = ReleaseResolver::new(self.ctx.transport, endpoint);
        let metadata = match resolver.fetch_latest().await {
            Ok(metadata) => metadata,
            Err(error) => return self.attempt_failed(attempt, error.into()),
        };

        if !is_update_needed(&metadata.version, &installed) {
            info!(
                "Firmware is up to date ({installed}, latest {})",
                metadata.version
            );
            if pending && let Err(error) = self.state_store.clear() {
                warn!("Failed to clear update flag: {error}");
            }
            self.transition(BootState::Idle);
            return BootOutcome::UpToDate {
                installed,
                latest: metadata.version,
            };
        }

        info!("Update available: {installed} -> {}", metadata.version);
        let attempt = match attempt {
            Some(attempt) => attempt,
            None => match self.state_store.begin() {
                Ok(state) => state.attempt_counter,
                Err(error) => return self.attempt_failed(None, error.into()),
            },
        };

        self.transition(BootState::Updating { attempt });
        match self.attempt_update(&metadata, &installed).await {
            Ok(()) => {
                self.transition(BootState::Idle);
                BootOutcome::Updated {
                    from: installed,
                    to: metadata.version,
                }
            }
            Err(error) => self.attempt_failed(Some(attempt), error),
        }
    }

    async fn attempt_update(
        &self,
        metadata: &ReleaseMetadata,
        installed: &FirmwareVersion,
    ) -> Result<(), UpdateError> {
        let asset = select_asset(
            metadata,
            &self.settings.device_model,
            &self.settings.asset_pattern,
        )?;

        let download = self.ctx.paths.download_file();
        Downloader::new(self.ctx.transport, self.settings.chunk_size)
            .fetch(&asset, &download)
            .await?;

        let staging = self.ctx.paths.staging_dir();
        let manifest =
            ArchiveInstaller::new(self.settings.required_files.clone()).stage(&download, &staging)?;
        if let Err(error) = std::fs::remove_file(&download) {
            warn!("Failed to remove {}: {error}", download.display());
        }

        UpdateApplier::new(
            self.ctx.paths.live_root(),
            &self.backup,
            &self.version_record,
            &self.state_store,
            self.ctx.reset,
        )
        .apply(&staging, &manifest, installed, &metadata.version)?;

        Ok(())
    }

    fn attempt_failed(&self, attempt: Option<u32>, error: UpdateError) -> BootOutcome {
        match (attempt, &error) {
            (Some(attempt), UpdateError::Apply(_)) => {
                error!("Update attempt {} failed, live files rolled back: {error}", attempt + 1);
            }
            (Some(attempt), _) => {
                error!(
                    "Update attempt {} failed ({}): {error}",
                    attempt + 1,
                    error.kind()
                );
            }
            (None, _) => error!("Update check failed ({}): {error}", error.kind()),
        }
        BootOutcome::AttemptFailed { attempt, error }
    }

    fn forced_restore(&mut self, attempts: u32) -> BootOutcome {
        self.transition(BootState::ForcedRestore);
        warn!("Update failed {attempts} time(s), disabling update on boot and restoring backup");

        if let Err(error) =
            self.ctx
                .config
                .set(SECTION_SYS_FIRMWARE, KEY_UPDATE_ON_BOOT, Value::Bool(false))
        {
            error!("Failed to disable update on boot: {error}");
        }

        let restored = self.restore_last_backup();
        if let Err(error) = self.state_store.clear() {
            error!("Failed to clear update flag after restore: {error}");
        }

        match restored {
            Ok(()) => {
                info!("Restore from backup complete, resetting");
                self.ctx.reset.reset();
                BootOutcome::Restored
            }
            Err(error) => {
                error!("FATAL: restore from backup failed, continuing boot as is: {error}");
                BootOutcome::RecoveryFailed(error)
            }
        }
    }

    fn restore_last_backup(&self) -> Result<(), RecoveryError> {
        let set = self.backup.load()?.ok_or(RecoveryError::NoBackup)?;
        self.backup.restore(&set)?;

        if let Some(previous) = set.previous_version()
            && let Err(error) = self.version_record.write(&previous)
        {
            warn!("Failed to reset version record to {previous}: {error}");
        }
        Ok(())
    }
}
