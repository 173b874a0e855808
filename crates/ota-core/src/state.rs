use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attempts allowed before the next boot forces a restore.
pub const ATTEMPT_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode update state: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StateError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    #[default]
    None,
    InProgress,
}

/// Persisted attempt guard. The flag file exists exactly while `phase` is
/// `InProgress`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub phase: UpdatePhase,
    #[serde(rename = "attempts")]
    pub attempt_counter: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl UpdateState {
    fn in_progress(attempt_counter: u32, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            phase: UpdatePhase::InProgress,
            attempt_counter,
            started_at,
        }
    }
}

pub struct UpdateStateStore {
    path: PathBuf,
}

impl UpdateStateStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state. A missing flag file means no attempt is in progress; an
    /// unreadable one is treated as exhausted.
    ///
    /// # Errors
    /// Returns an error if the flag file exists but cannot be read.
    pub fn load(&self) -> Result<UpdateState, StateError> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UpdateState::default());
            }
            Err(error) => return Err(StateError::io("failed to read", &self.path, error)),
        };

        match serde_json::from_slice::<UpdateState>(&content) {
            Ok(state) => Ok(UpdateState::in_progress(state.attempt_counter, state.started_at)),
            Err(error) => {
                warn!(
                    "Update flag {} is unreadable ({error}), treating it as exhausted",
                    self.path.display()
                );
                Ok(UpdateState::in_progress(ATTEMPT_THRESHOLD, None))
            }
        }
    }

    /// Create the flag for a fresh attempt with the counter at zero.
    ///
    /// # Errors
    /// Returns an error if the flag file cannot be written.
    pub fn begin(&self) -> Result<UpdateState, StateError> {
        let state = UpdateState::in_progress(0, Some(Utc::now()));
        self.save(&state)?;
        debug!("Created update flag {}", self.path.display());
        Ok(state)
    }

    /// Bump the counter of an existing attempt and persist it before
    /// returning the new value.
    ///
    /// # Errors
    /// Returns an error if the flag file cannot be read or written.
    pub fn increment(&self) -> Result<u32, StateError> {
        let current = self.load()?;
        let next = current.attempt_counter.saturating_add(1);
        self.save(&UpdateState::in_progress(next, current.started_at))?;
        debug!("Update attempt counter is now {next}");
        Ok(next)
    }

    /// Remove the flag. Clearing an absent flag is not an error.
    ///
    /// # Errors
    /// Returns an error if the flag file exists but cannot be removed.
    pub fn clear(&self) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed update flag {}", self.path.display());
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StateError::io("failed to remove", &self.path, error)),
        }
    }

    fn save(&self, state: &UpdateState) -> Result<(), StateError> {
        let data = serde_json::to_vec(state).map_err(StateError::Encode)?;
        ota_platform::write_atomic(&self.path, &data)
            .map_err(|error| StateError::io("failed to write", &self.path, error))
    }
}
