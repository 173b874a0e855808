use thiserror::Error;

use crate::apply::ApplyError;
use crate::archive::IntegrityError;
use crate::backup::RecoveryError;
use crate::download::DownloadError;
use crate::release::MetadataError;
use crate::state::StateError;

/// Any failure of one update attempt.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl UpdateError {
    /// Short name of the failure kind, for log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Metadata(_) => "metadata",
            Self::Download(_) => "download",
            Self::Integrity(_) => "integrity",
            Self::Apply(_) => "apply",
            Self::Recovery(_) => "recovery",
            Self::State(_) => "state",
        }
    }
}
