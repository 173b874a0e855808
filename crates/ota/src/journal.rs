use std::io::Write;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use log::warn;
use ota_core::BootOutcome;

use crate::logging::{open_append, trim_to_recent_half};

pub const DEFAULT_MAX_JOURNAL_SIZE: u64 = 64 * 1024;

/// One line per boot that did update work, kept apart from the general log
/// so the update history survives heavy debug logging.
pub struct UpdateJournal {
    path: PathBuf,
    max_size: u64,
}

impl UpdateJournal {
    #[must_use]
    pub fn new(path: PathBuf, max_size: u64) -> Self {
        Self { path, max_size }
    }

    /// Append `outcome` if it records an update attempt or a restore.
    /// Failures are logged and otherwise ignored.
    pub fn record(&self, outcome: &BootOutcome) {
        let Some(status) = status(outcome) else {
            return;
        };

        trim_to_recent_half(&self.path, self.max_size);
        let line = format!(
            "{} {status} {outcome}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let written = open_append(&self.path).and_then(|mut file| {
            file.write_all(line.as_bytes())?;
            file.sync_data()
        });
        if let Err(error) = written {
            warn!("Failed to write {}: {error}", self.path.display());
        }
    }
}

fn status(outcome: &BootOutcome) -> Option<&'static str> {
    match outcome {
        BootOutcome::Updated { .. } => Some("UPDATED"),
        BootOutcome::Restored => Some("RESTORED"),
        BootOutcome::AttemptFailed { attempt: Some(_), .. } => Some("FAILED"),
        BootOutcome::RecoveryFailed(_) => Some("FATAL"),
        BootOutcome::AttemptFailed { attempt: None, .. }
        | BootOutcome::Idle
        | BootOutcome::UpToDate { .. }
        | BootOutcome::Skipped { .. }
        | BootOutcome::NetworkUnavailable => None,
    }
}
