use std::path::{Path, PathBuf};

use log::warn;

use crate::version::FirmwareVersion;

/// Installed firmware version, kept as a single line of text.
pub struct VersionRecord {
    path: PathBuf,
}

impl VersionRecord {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Installed version, or [`FirmwareVersion::UNKNOWN`] when nothing usable
    /// is recorded.
    #[must_use]
    pub fn read(&self) -> FirmwareVersion {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return FirmwareVersion::UNKNOWN;
            }
            Err(error) => {
                warn!("Failed to read {}: {error}", self.path.display());
                return FirmwareVersion::UNKNOWN;
            }
        };

        FirmwareVersion::parse(&content).unwrap_or_else(|error| {
            warn!("Ignoring invalid version record: {error}");
            FirmwareVersion::UNKNOWN
        })
    }

    /// Replace the record atomically.
    ///
    /// # Errors
    /// Returns an error if the record cannot be written.
    pub fn write(&self, version: &FirmwareVersion) -> std::io::Result<()> {
        ota_platform::write_atomic(&self.path, version.to_string().as_bytes())
    }
}
