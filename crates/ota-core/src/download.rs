use std::path::Path;

use log::{debug, info};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::release::AssetDescriptor;
use crate::transport::{HttpTransport, TransportError};

pub const DEFAULT_CHUNK_SIZE: usize = 2048;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    Transport(#[source] TransportError),
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("download exceeded the declared size of {expected} bytes")]
    Oversized { expected: u64 },
    #[error("download size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl DownloadError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Streams a release asset to local storage.
pub struct Downloader<'a> {
    transport: &'a dyn HttpTransport,
    chunk_size: usize,
}

impl<'a> Downloader<'a> {
    #[must_use]
    pub fn new(transport: &'a dyn HttpTransport, chunk_size: usize) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Download `asset` to `dest`, writing at most `chunk_size` bytes at a time.
    ///
    /// A partial file is left in place on failure. It is never treated as valid:
    /// the next attempt truncates it.
    ///
    /// # Errors
    /// Returns an error if the connection fails, the file cannot be written, or
    /// the byte count differs from the declared asset size.
    pub async fn fetch(&self, asset: &AssetDescriptor, dest: &Path) -> Result<u64, DownloadError> {
        info!(
            "Downloading {} ({} bytes) from {}",
            asset.name, asset.size_bytes, asset.download_url
        );

        let mut body = self
            .transport
            .get_stream(&asset.download_url)
            .await
            .map_err(DownloadError::Transport)?;
        if let Some(length) = body.content_length()
            && length != asset.size_bytes
        {
            debug!(
                "Server reports {length} bytes for {}, release lists {}",
                asset.name, asset.size_bytes
            );
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|error| DownloadError::io("failed to create", dest, error))?;

        let expected = asset.size_bytes;
        let mut downloaded: u64 = 0;
        let mut next_report = 25;

        while let Some(chunk) = body.next_chunk().await.map_err(DownloadError::Transport)? {
            for piece in chunk.chunks(self.chunk_size) {
                downloaded += piece.len() as u64;
                if downloaded > expected {
                    return Err(DownloadError::Oversized { expected });
                }
                file.write_all(piece)
                    .await
                    .map_err(|error| DownloadError::io("failed to write", dest, error))?;
            }

            if expected > 0 {
                let percent = downloaded * 100 / expected;
                if percent >= next_report {
                    info!("Downloaded {percent}% ({downloaded}/{expected} bytes)");
                    next_report = (percent / 25 + 1) * 25;
                }
            }
        }

        file.flush()
            .await
            .map_err(|error| DownloadError::io("failed to flush", dest, error))?;
        file.sync_all()
            .await
            .map_err(|error| DownloadError::io("failed to sync", dest, error))?;

        if downloaded != expected {
            return Err(DownloadError::SizeMismatch {
                expected,
                actual: downloaded,
            });
        }

        info!("Download complete: {downloaded} bytes");
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    const URL: &str = "https://downloads.test/pico-firmware.tar.zlib";

    fn asset(size: u64) -> AssetDescriptor {
        AssetDescriptor {
            name: "pico-firmware.tar.zlib".to_string(),
            download_url: URL.to_string(),
            size_bytes: size,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
    }

    #[tokio::test]
    async fn fetch_writes_complete_body() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("update.tar.zlib");
        let data = payload(5000);
        let transport = FakeTransport::new().with_bytes(URL, data.clone());

        let written = Downloader::new(&transport, DEFAULT_CHUNK_SIZE)
            .fetch(&asset(5000), &dest)
            .await
            .expect("download should succeed");

        assert_eq!(written, 5000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn fetch_rejects_short_body_and_leaves_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("update.tar.zlib");
        let transport = FakeTransport::new().with_bytes(URL, payload(3000));

        let error = Downloader::new(&transport, DEFAULT_CHUNK_SIZE)
            .fetch(&asset(4000), &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DownloadError::SizeMismatch {
                expected: 4000,
                actual: 3000
            }
        ));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 3000);
    }

    #[tokio::test]
    async fn fetch_aborts_when_body_exceeds_declared_size() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("update.tar.zlib");
        let transport = FakeTransport::new().with_bytes(URL, payload(10_000));

        let error = Downloader::new(&transport, 512)
            .fetch(&asset(1000), &dest)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::Oversized { expected: 1000 }));
        assert!(std::fs::metadata(&dest).unwrap().len() <= 1000);
    }

    #[tokio::test]
    async fn fetch_reports_interrupted_transfer() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("update.tar.zlib");
        let transport = FakeTransport::new().with_interrupted(URL, payload(5000), 1500);

        let error = Downloader::new(&transport, DEFAULT_CHUNK_SIZE)
            .fetch(&asset(5000), &dest)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::Transport(_)));
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn fetch_reports_unwritable_destination() {
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("missing-dir").join("update.tar.zlib");
        let transport = FakeTransport::new().with_bytes(URL, payload(10));

        let error = Downloader::new(&transport, DEFAULT_CHUNK_SIZE)
            .fetch(&asset(10), &dest)
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::Io { .. }));
    }
}
