use std::collections::BTreeMap;

use crate::archive::{IntegrityError, normalize_entry_path};

/// Name of the archive's first entry.
pub const MANIFEST_NAME: &str = "integrity.json";

/// Expected SHA-256 per relative path, as shipped inside the archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityManifest {
    entries: BTreeMap<String, String>,
}

impl IntegrityManifest {
    /// Parse the manifest document: a flat JSON object of path to hex digest.
    ///
    /// # Errors
    /// Returns an error if the document is not an object of strings, a path is
    /// not a safe relative path, or a digest is not 64 hex characters.
    pub fn from_json(data: &[u8]) -> Result<Self, IntegrityError> {
        let raw: BTreeMap<String, String> = serde_json::from_slice(data)
            .map_err(|error| IntegrityError::InvalidManifest(error.to_string()))?;

        let mut entries = BTreeMap::new();
        for (path, digest) in raw {
            let path = normalize_entry_path(&path).ok_or(IntegrityError::UnsafePath { path })?;
            let digest = parse_sha256_digest(&digest).ok_or_else(|| {
                IntegrityError::InvalidManifest(format!("invalid SHA-256 for {path}"))
            })?;
            if entries.insert(path.clone(), digest).is_some() {
                return Err(IntegrityError::InvalidManifest(format!(
                    "duplicate manifest entry {path}"
                )));
            }
        }

        Ok(Self { entries })
    }

    #[must_use]
    pub fn expected_digest(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Relative paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_sha256_digest(digest: &str) -> Option<String> {
    let value = digest.trim();
    let value = value.strip_prefix("sha256:").unwrap_or(value);
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(value.to_ascii_lowercase())
    } else {
        None
    }
}
