//! Over-the-air firmware update engine.
//!
//! One boot runs [`BootRecoveryController::run`]: check the release endpoint,
//! download the model's archive, verify every file against the archive's
//! integrity manifest while staging it, back up and swap the live files, then
//! reset. A flag file counts unfinished attempts across resets and forces a
//! restore from backup after [`ATTEMPT_THRESHOLD`] of them.

pub mod apply;
pub mod archive;
pub mod backup;
pub mod controller;
pub mod download;
pub mod error;
pub mod manifest;
pub mod release;
pub mod settings;
pub mod state;
pub mod transport;
pub mod version;
pub mod version_record;

#[cfg(test)]
mod test_support;

pub use apply::{ApplyError, UpdateApplier};
pub use archive::{ArchiveInstaller, IntegrityError};
pub use backup::{BackupManager, BackupSet, RecoveryError};
pub use controller::{BootOutcome, BootRecoveryController, BootState, UpdateContext};
pub use download::{DownloadError, Downloader};
pub use error::UpdateError;
pub use manifest::{IntegrityManifest, MANIFEST_NAME};
pub use release::{
    AssetDescriptor, MetadataError, ReleaseEndpoint, ReleaseMetadata, ReleaseResolver,
    is_update_needed, select_asset,
};
pub use settings::UpdateSettings;
pub use state::{ATTEMPT_THRESHOLD, StateError, UpdatePhase, UpdateState, UpdateStateStore};
pub use transport::{BodyStream, HttpTransport, ReqwestTransport, TransportError, TransportOptions};
pub use version::{FirmwareVersion, VersionParseError, compare};
pub use version_record::VersionRecord;
