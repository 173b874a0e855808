use std::io::Write;
use std::path::Path;

/// Replace `path` with `data` so that readers only ever observe the previous
/// content or the new content, never a torn write.
///
/// The data goes to a temp file in the same directory, which is synced and
/// renamed over the target. On unix the directory is synced afterwards so the
/// rename itself survives a power cut.
///
/// # Errors
/// Returns an error if the target is a directory, if the temp file cannot be
/// created or written, or if the final rename fails. The temp file is removed
/// on failure.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if path.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is a directory", path.display()),
        ));
    }
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "target path has no parent")
    })?;

    let mut temp = tempfile::Builder::new()
        .prefix(".ota-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|error| error.error)?;

    sync_dir(parent);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(error) = std::fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        log::debug!("Failed to sync {}: {error}", dir.display());
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
