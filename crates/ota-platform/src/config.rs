use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::fsutil::write_atomic;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to save configuration to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Persistent, sectioned device configuration.
///
/// Values are loosely typed JSON; the typed getters return `None` when a key
/// is missing or holds a value of a different type.
pub trait ConfigStore: Send + Sync {
    fn get(&self, section: &str, key: &str) -> Option<Value>;

    /// Set a value and persist the whole configuration.
    ///
    /// # Errors
    /// Returns an error when the configuration cannot be persisted.
    fn set(&self, section: &str, key: &str, value: Value) -> Result<(), ConfigError>;

    fn get_str(&self, section: &str, key: &str) -> Option<String> {
        match self.get(section, key)? {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.get(section, key)?.as_bool()
    }

    fn get_u64(&self, section: &str, key: &str) -> Option<u64> {
        self.get(section, key)?.as_u64()
    }

    fn get_list(&self, section: &str, key: &str) -> Option<Vec<String>> {
        let Value::Array(items) = self.get(section, key)? else {
            return None;
        };
        Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(value) => Some(value),
                    _ => None,
                })
                .collect(),
        )
    }
}

/// Configuration stored as one JSON object of sections on disk.
pub struct JsonConfigStore {
    path: PathBuf,
    sections: Mutex<Map<String, Value>>,
}

impl JsonConfigStore {
    /// Load the configuration at `path`.
    ///
    /// A missing or unreadable file yields an empty configuration; the file is
    /// created on the first `set`.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sections = load_sections(&path);
        Self {
            path,
            sections: Mutex::new(sections),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_sections(path: &Path) -> Map<String, Value> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(error) => {
            warn!(
                "Could not load config from {} ({error}), using empty config",
                path.display()
            );
            return Map::new();
        }
    };

    match serde_json::from_str::<Value>(&data) {
        Ok(Value::Object(sections)) => {
            info!("Loaded config from {}", path.display());
            sections
        }
        Ok(_) => {
            warn!(
                "Invalid config format in {} (not an object), using empty config",
                path.display()
            );
            Map::new()
        }
        Err(error) => {
            warn!(
                "Invalid JSON in config {} ({error}), using empty config",
                path.display()
            );
            Map::new()
        }
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, section: &str, key: &str) -> Option<Value> {
        let sections = self
            .sections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sections.get(section)?.get(key).cloned()
    }

    fn set(&self, section: &str, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut sections = self
            .sections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let entry = sections
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(values) = entry {
            if values.get(key) == Some(&value) {
                return Ok(());
            }
            debug!("Config set: {section}.{key} = {value}");
            values.insert(key.to_string(), value);
        }

        let data = serde_json::to_vec_pretty(&*sections).map_err(ConfigError::Serialize)?;
        write_atomic(&self.path, &data).map_err(|source| ConfigError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }
}
