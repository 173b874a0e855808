use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use crate::manifest::MANIFEST_NAME;
use crate::transport::{BodyStream, HttpTransport, TransportError};

#[derive(Clone)]
enum Route {
    Body {
        data: Vec<u8>,
        chunk_len: usize,
        fail_after: Option<usize>,
    },
    Status(StatusCode),
}

/// In-memory transport serving canned responses by URL.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(self, url: &str, route: Route) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), route);
        self
    }

    pub fn with_text(self, url: &str, body: &str) -> Self {
        self.with_bytes(url, body.as_bytes().to_vec())
    }

    pub fn with_bytes(self, url: &str, data: Vec<u8>) -> Self {
        self.route(
            url,
            Route::Body {
                data,
                chunk_len: 700,
                fail_after: None,
            },
        )
    }

    /// Serve `data` but drop the connection once `fail_after` bytes were sent.
    pub fn with_interrupted(self, url: &str, data: Vec<u8>, fail_after: usize) -> Self {
        self.route(
            url,
            Route::Body {
                data,
                chunk_len: 700,
                fail_after: Some(fail_after),
            },
        )
    }

    pub fn with_status(self, url: &str, status: StatusCode) -> Self {
        self.route(url, Route::Status(status))
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn lookup(&self, url: &str) -> Result<Route, TransportError> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.routes.lock().unwrap().get(url).cloned() {
            Some(Route::Status(status)) => Err(TransportError::Status {
                url: url.to_string(),
                status,
                body_snippet: String::new(),
            }),
            Some(route) => Ok(route),
            None => Err(TransportError::Status {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND,
                body_snippet: String::new(),
            }),
        }
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        match self.lookup(url)? {
            Route::Body { data, .. } => {
                String::from_utf8(data).map_err(|error| TransportError::Interrupted {
                    url: url.to_string(),
                    details: error.to_string(),
                })
            }
            Route::Status(_) => unreachable!("status routes are returned as errors"),
        }
    }

    async fn get_stream(&self, url: &str) -> Result<Box<dyn BodyStream>, TransportError> {
        match self.lookup(url)? {
            Route::Body {
                data,
                chunk_len,
                fail_after,
            } => Ok(Box::new(FakeBody {
                url: url.to_string(),
                data,
                position: 0,
                chunk_len,
                fail_after,
            })),
            Route::Status(_) => unreachable!("status routes are returned as errors"),
        }
    }
}

struct FakeBody {
    url: String,
    data: Vec<u8>,
    position: usize,
    chunk_len: usize,
    fail_after: Option<usize>,
}

#[async_trait]
impl BodyStream for FakeBody {
    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(limit) = self.fail_after
            && self.position >= limit
        {
            return Err(TransportError::Interrupted {
                url: self.url.clone(),
                details: "connection reset by peer".to_string(),
            });
        }
        if self.position >= self.data.len() {
            return Ok(None);
        }

        let mut end = (self.position + self.chunk_len).min(self.data.len());
        if let Some(limit) = self.fail_after {
            end = end.min(limit.max(self.position + 1));
        }
        let chunk = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(Some(chunk))
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// `integrity.json` body listing every file with its real digest.
pub fn manifest_json(files: &[(&str, &[u8])]) -> Vec<u8> {
    let entries: serde_json::Map<String, serde_json::Value> = files
        .iter()
        .map(|(path, data)| ((*path).to_string(), sha256_hex(data).into()))
        .collect();
    serde_json::to_vec(&entries).unwrap()
}

/// Raw tar bytes for the given entries, in order.
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Firmware archive with a correct manifest first, then `files`.
pub fn firmware_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let manifest = manifest_json(files);
    let mut entries: Vec<(&str, &[u8])> = vec![(MANIFEST_NAME, manifest.as_slice())];
    entries.extend_from_slice(files);
    zlib(&tar_bytes(&entries))
}
