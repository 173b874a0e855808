use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path};

use flate2::read::ZlibDecoder;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::manifest::{IntegrityManifest, MANIFEST_NAME};

const ENTRY_BUFFER_SIZE: usize = 4096;
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("{context}: {source}")]
    Container {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context} {path}: {source}")]
    Staging {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive is empty")]
    EmptyArchive,
    #[error("first archive entry must be {MANIFEST_NAME}, found '{found}'")]
    ManifestNotFirst { found: String },
    #[error("invalid integrity manifest: {0}")]
    InvalidManifest(String),
    #[error("unsafe path in archive: '{path}'")]
    UnsafePath { path: String },
    #[error("unsupported {kind} entry in archive: {path}")]
    UnsupportedEntry { path: String, kind: String },
    #[error("duplicate archive entry {path}")]
    DuplicateEntry { path: String },
    #[error("archive entry {path} is not listed in the manifest")]
    NotInManifest { path: String },
    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("files listed in the manifest are missing from the archive: {}", paths.join(", "))]
    MissingFiles { paths: Vec<String> },
    #[error("required files are missing from the manifest: {}", paths.join(", "))]
    MissingRequired { paths: Vec<String> },
}

impl IntegrityError {
    fn container(context: &'static str, source: std::io::Error) -> Self {
        Self::Container { context, source }
    }

    fn staging(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Staging {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Normalize an archive or manifest path to `a/b/c` form.
///
/// Returns `None` for absolute paths, paths with `..` or `.` components,
/// paths starting with `.`, and empty paths.
pub(crate) fn normalize_entry_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut relative = unified.as_str();
    while let Some(rest) = relative.strip_prefix("./") {
        relative = rest;
    }
    let relative = relative.trim_end_matches('/');

    if relative.is_empty() || relative.starts_with('.') || relative.starts_with('/') {
        return None;
    }

    let mut parts = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str()?;
                if part.contains(':') {
                    return None;
                }
                parts.push(part);
            }
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return None;
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Unpacks a downloaded firmware archive into staging, verifying every file.
pub struct ArchiveInstaller {
    required_files: Vec<String>,
}

impl ArchiveInstaller {
    #[must_use]
    pub fn new(required_files: Vec<String>) -> Self {
        Self { required_files }
    }

    /// Decompress `archive_path` and stream every entry into `staging_dir`,
    /// checking each against the manifest.
    ///
    /// On success `staging_dir` holds exactly the manifest's files. On any
    /// failure it is left empty. The live filesystem is never touched.
    ///
    /// # Errors
    /// Returns an error if the container is unreadable, the manifest is not the
    /// first entry, an entry is unsafe or unlisted, a digest does not match, or
    /// a listed file is missing.
    pub fn stage(
        &self,
        archive_path: &Path,
        staging_dir: &Path,
    ) -> Result<IntegrityManifest, IntegrityError> {
        reset_dir(staging_dir)?;

        match self.stage_entries(archive_path, staging_dir) {
            Ok(manifest) => {
                info!(
                    "Staged {} verified file(s) in {}",
                    manifest.len(),
                    staging_dir.display()
                );
                Ok(manifest)
            }
            Err(error) => {
                warn!("Staging failed, clearing {}: {error}", staging_dir.display());
                if let Err(clear_error) = reset_dir(staging_dir) {
                    warn!("Failed to clear staging directory: {clear_error}");
                }
                Err(error)
            }
        }
    }

    fn stage_entries(
        &self,
        archive_path: &Path,
        staging_dir: &Path,
    ) -> Result<IntegrityManifest, IntegrityError> {
        let file = File::open(archive_path)
            .map_err(|error| IntegrityError::staging("failed to open", archive_path, error))?;
        let mut archive = tar::Archive::new(ZlibDecoder::new(BufReader::new(file)));
        let entries = archive
            .entries()
            .map_err(|error| IntegrityError::container("failed to read archive", error))?;

        let mut manifest: Option<IntegrityManifest> = None;
        let mut staged = BTreeSet::new();

        for entry in entries {
            let mut entry = entry
                .map_err(|error| IntegrityError::container("failed to read archive entry", error))?;
            let entry_type = entry.header().entry_type();
            if matches!(
                entry_type,
                tar::EntryType::XGlobalHeader | tar::EntryType::XHeader
            ) {
                continue;
            }

            let raw_path = entry
                .path()
                .map_err(|error| IntegrityError::container("invalid entry path", error))?
                .to_string_lossy()
                .into_owned();
            let path =
                normalize_entry_path(&raw_path).ok_or(IntegrityError::UnsafePath { path: raw_path })?;

            let Some(listed) = manifest.as_ref() else {
                if path != MANIFEST_NAME || !entry_type.is_file() {
                    return Err(IntegrityError::ManifestNotFirst { found: path });
                }
                manifest = Some(self.read_manifest(&mut entry)?);
                continue;
            };

            if entry_type.is_dir() {
                let dir = staging_dir.join(&path);
                std::fs::create_dir_all(&dir)
                    .map_err(|error| IntegrityError::staging("failed to create", &dir, error))?;
                continue;
            }
            if !entry_type.is_file() {
                return Err(IntegrityError::UnsupportedEntry {
                    path,
                    kind: format!("{entry_type:?}"),
                });
            }
            if path == MANIFEST_NAME || staged.contains(&path) {
                return Err(IntegrityError::DuplicateEntry { path });
            }
            let Some(expected) = listed.expected_digest(&path) else {
                return Err(IntegrityError::NotInManifest { path });
            };

            let actual = stream_entry(&mut entry, &staging_dir.join(&path))?;
            if actual != expected {
                return Err(IntegrityError::DigestMismatch {
                    path,
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!("Verified {path}");
            staged.insert(path);
        }

        let manifest = manifest.ok_or(IntegrityError::EmptyArchive)?;
        let missing: Vec<String> = manifest
            .paths()
            .filter(|path| !staged.contains(*path))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(IntegrityError::MissingFiles { paths: missing });
        }

        Ok(manifest)
    }

    fn read_manifest(&self, entry: &mut impl Read) -> Result<IntegrityManifest, IntegrityError> {
        let mut data = Vec::new();
        entry
            .take(MAX_MANIFEST_BYTES + 1)
            .read_to_end(&mut data)
            .map_err(|error| IntegrityError::container("failed to read manifest", error))?;
        if data.len() as u64 > MAX_MANIFEST_BYTES {
            return Err(IntegrityError::InvalidManifest(
                "manifest is too large".to_string(),
            ));
        }

        let manifest = IntegrityManifest::from_json(&data)?;
        if manifest.is_empty() {
            return Err(IntegrityError::InvalidManifest(
                "manifest lists no files".to_string(),
            ));
        }

        let missing: Vec<String> = self
            .required_files
            .iter()
            .filter(|required| !manifest.contains(required))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(IntegrityError::MissingRequired { paths: missing });
        }

        debug!("Manifest lists {} file(s)", manifest.len());
        Ok(manifest)
    }
}

/// Copy one entry to `dest` while hashing it; returns the lowercase hex digest.
fn stream_entry(entry: &mut impl Read, dest: &Path) -> Result<String, IntegrityError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|error| IntegrityError::staging("failed to create", parent, error))?;
    }
    let mut file = File::create(dest)
        .map_err(|error| IntegrityError::staging("failed to create", dest, error))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; ENTRY_BUFFER_SIZE];
    loop {
        let read = entry
            .read(&mut buffer)
            .map_err(|error| IntegrityError::container("failed to read archive entry", error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        file.write_all(&buffer[..read])
            .map_err(|error| IntegrityError::staging("failed to write", dest, error))?;
    }
    file.sync_all()
        .map_err(|error| IntegrityError::staging("failed to sync", dest, error))?;

    Ok(format!("{:x}", hasher.finalize()))
}

fn reset_dir(dir: &Path) -> Result<(), IntegrityError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(IntegrityError::staging("failed to clear", dir, error)),
    }
    std::fs::create_dir_all(dir)
        .map_err(|error| IntegrityError::staging("failed to create", dir, error))
}
