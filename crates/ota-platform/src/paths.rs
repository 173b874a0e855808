use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable that overrides the device root directory.
pub const DEVICE_ROOT_ENV: &str = "OTA_DEVICE_ROOT";

const FLAG_FILE: &str = "__updating";
const VERSION_FILE: &str = "version.txt";
const BACKUP_DIR: &str = "backup";
const STAGING_DIR: &str = "update";
const DOWNLOAD_FILE: &str = "update.tar.zlib";
const CONFIG_FILE: &str = "config.json";
const LOG_FILE: &str = "log.txt";
const UPDATE_LOG_FILE: &str = "update.log";
const LOCK_FILE: &str = ".ota.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DevicePathsError {
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

/// Layout of the device filesystem.
///
/// Firmware files live directly under `root`; the update engine's own state
/// (flag file, version record, backup and staging directories) sits beside
/// them under reserved names.
#[derive(Debug, Clone)]
pub struct DevicePaths {
    pub root: PathBuf,
}

impl DevicePaths {
    /// Resolve the device root from `OTA_DEVICE_ROOT`, falling back to the
    /// platform data directory.
    ///
    /// # Errors
    /// Returns an error when the variable is unset and no platform data
    /// directory can be determined.
    pub fn new() -> Result<Self, DevicePathsError> {
        if let Some(root) = std::env::var_os(DEVICE_ROOT_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::at(root));
        }

        let data_dir = dirs::data_dir().ok_or(DevicePathsError::DataDirUnavailable)?;
        Ok(Self::at(data_dir.join("ota-device")))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn live_root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn flag_file(&self) -> PathBuf {
        self.root.join(FLAG_FILE)
    }

    #[must_use]
    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    #[must_use]
    pub fn download_file(&self) -> PathBuf {
        self.root.join(DOWNLOAD_FILE)
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    #[must_use]
    pub fn update_log_file(&self) -> PathBuf {
        self.root.join(UPDATE_LOG_FILE)
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Top-level names under the root that firmware files may never replace.
    #[must_use]
    pub fn reserved_names() -> &'static [&'static str] {
        &[
            FLAG_FILE,
            VERSION_FILE,
            BACKUP_DIR,
            STAGING_DIR,
            DOWNLOAD_FILE,
            CONFIG_FILE,
            LOG_FILE,
            UPDATE_LOG_FILE,
            LOCK_FILE,
        ]
    }

    /// Ensure the root exists on disk.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }
}
