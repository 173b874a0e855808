use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::transport::{HttpTransport, TransportError};
use crate::version::{FirmwareVersion, VersionParseError};

pub const DEFAULT_ASSET_PATTERN: &str = "{model}-firmware.tar.zlib";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to fetch release metadata: {0}")]
    Transport(#[source] TransportError),
    #[error("failed to parse release metadata: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("release metadata has no version tag")]
    MissingVersion,
    #[error("release tag '{tag}' is not a firmware version: {source}")]
    InvalidVersion {
        tag: String,
        #[source]
        source: VersionParseError,
    },
    #[error("release {version} has no assets")]
    NoAssets { version: FirmwareVersion },
    #[error("no release asset matches '{pattern}'")]
    NoMatchingAsset { pattern: String },
    #[error("several release assets match '{pattern}': {}", names.join(", "))]
    AmbiguousAsset { pattern: String, names: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub name: String,
    pub download_url: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseMetadata {
    pub version: FirmwareVersion,
    pub assets: Vec<AssetDescriptor>,
}

#[derive(Deserialize)]
struct RawAsset {
    name: String,
    browser_download_url: String,
    size: u64,
}

#[derive(Deserialize)]
struct RawRelease {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    assets: Option<Vec<RawAsset>>,
}

/// Where the release document lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseEndpoint {
    /// Latest release of a hosted repository (`owner/name`).
    GitHub { repo: String },
    /// Self-hosted `metadata.json` under a base URL.
    Direct { base_url: String },
}

impl ReleaseEndpoint {
    #[must_use]
    pub fn url(&self) -> String {
        match self {
            Self::GitHub { repo } => {
                format!("https://api.github.com/repos/{repo}/releases/latest")
            }
            Self::Direct { base_url } => {
                if base_url.ends_with('/') {
                    format!("{base_url}metadata.json")
                } else {
                    format!("{base_url}/metadata.json")
                }
            }
        }
    }

    /// Host and port whose reachability stands for "network is up".
    #[must_use]
    pub fn probe_target(&self) -> Option<(String, u16)> {
        let url = reqwest::Url::parse(&self.url()).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        Some((host, port))
    }
}

/// Parse a hosted-release document.
///
/// # Errors
/// Returns an error if the document is not valid JSON, has no usable version
/// tag, or lists no assets.
pub fn parse_release(body: &str) -> Result<ReleaseMetadata, MetadataError> {
    let raw: RawRelease = serde_json::from_str(body).map_err(MetadataError::Parse)?;

    let tag = raw
        .tag_name
        .filter(|tag| !tag.trim().is_empty())
        .ok_or(MetadataError::MissingVersion)?;
    let version = FirmwareVersion::parse(&tag)
        .map_err(|source| MetadataError::InvalidVersion { tag, source })?;

    let assets: Vec<AssetDescriptor> = raw
        .assets
        .unwrap_or_default()
        .into_iter()
        .map(|asset| AssetDescriptor {
            name: asset.name,
            download_url: asset.browser_download_url,
            size_bytes: asset.size,
        })
        .collect();

    if assets.is_empty() {
        return Err(MetadataError::NoAssets { version });
    }

    Ok(ReleaseMetadata { version, assets })
}

/// Pick the one asset built for `device_model`.
///
/// `pattern` may contain `{model}`; an asset matches when its name ends with
/// the expanded pattern, ignoring ASCII case.
///
/// # Errors
/// Returns an error when no asset or more than one asset matches.
pub fn select_asset(
    metadata: &ReleaseMetadata,
    device_model: &str,
    pattern: &str,
) -> Result<AssetDescriptor, MetadataError> {
    let expected = pattern.replace("{model}", device_model).to_ascii_lowercase();

    let mut matches: Vec<&AssetDescriptor> = metadata
        .assets
        .iter()
        .filter(|asset| asset.name.to_ascii_lowercase().ends_with(&expected))
        .collect();

    match matches.len() {
        0 => Err(MetadataError::NoMatchingAsset { pattern: expected }),
        1 => Ok(matches.remove(0).clone()),
        _ => Err(MetadataError::AmbiguousAsset {
            pattern: expected,
            names: matches.iter().map(|asset| asset.name.clone()).collect(),
        }),
    }
}

#[must_use]
pub fn is_update_needed(remote: &FirmwareVersion, installed: &FirmwareVersion) -> bool {
    remote > installed
}

pub struct ReleaseResolver<'a> {
    transport: &'a dyn HttpTransport,
    endpoint: ReleaseEndpoint,
}

impl<'a> ReleaseResolver<'a> {
    #[must_use]
    pub fn new(transport: &'a dyn HttpTransport, endpoint: ReleaseEndpoint) -> Self {
        Self {
            transport,
            endpoint,
        }
    }

    /// Fetch and parse the latest release document.
    ///
    /// # Errors
    /// Returns an error on transport failure, a non-success status, or a
    /// malformed document.
    pub async fn fetch_latest(&self) -> Result<ReleaseMetadata, MetadataError> {
        let url = self.endpoint.url();
        info!("Checking for updates at {url}");

        let body = self
            .transport
            .get_text(&url)
            .await
            .map_err(MetadataError::Transport)?;
        let metadata = parse_release(&body)?;

        debug!(
            "Latest release {} with {} asset(s)",
            metadata.version,
            metadata.assets.len()
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeTransport;

    fn asset(name: &str) -> AssetDescriptor {
        AssetDescriptor {
            name: name.to_string(),
            download_url: format!("https://downloads.test/{name}"),
            size_bytes: 100,
        }
    }

    fn metadata(names: &[&str]) -> ReleaseMetadata {
        ReleaseMetadata {
            version: FirmwareVersion::new(1, 3, 0),
            assets: names.iter().map(|name| asset(name)).collect(),
        }
    }

    #[test]
    fn endpoint_urls() {
        let github = ReleaseEndpoint::GitHub {
            repo: "acme/sensor-fw".to_string(),
        };
        assert_eq!(
            github.url(),
            "https://api.github.com/repos/acme/sensor-fw/releases/latest"
        );

        let direct = ReleaseEndpoint::Direct {
            base_url: "https://fw.example.test/stable".to_string(),
        };
        assert_eq!(direct.url(), "https://fw.example.test/stable/metadata.json");

        let direct_slash = ReleaseEndpoint::Direct {
            base_url: "https://fw.example.test/stable/".to_string(),
        };
        assert_eq!(
            direct_slash.url(),
            "https://fw.example.test/stable/metadata.json"
        );
    }

    #[test]
    fn probe_target_follows_endpoint_host() {
        let github = ReleaseEndpoint::GitHub {
            repo: "acme/fw".to_string(),
        };
        assert_eq!(
            github.probe_target(),
            Some(("api.github.com".to_string(), 443))
        );

        let direct = ReleaseEndpoint::Direct {
            base_url: "http://10.0.0.5:8080/fw".to_string(),
        };
        assert_eq!(direct.probe_target(), Some(("10.0.0.5".to_string(), 8080)));

        let broken = ReleaseEndpoint::Direct {
            base_url: "not a url".to_string(),
        };
        assert_eq!(broken.probe_target(), None);
    }

    #[test]
    fn parse_release_reads_tag_and_assets() {
        let body = r#"{
            "tag_name": "v1.3.0",
            "html_url": "https://example.test/releases/v1.3.0",
            "assets": [
                {"name": "pico-firmware.tar.zlib", "browser_download_url": "https://dl.test/a", "size": 4096}
            ]
        }"#;

        let metadata = parse_release(body).expect("release should parse");
        assert_eq!(metadata.version, FirmwareVersion::new(1, 3, 0));
        assert_eq!(
            metadata.assets,
            vec![AssetDescriptor {
                name: "pico-firmware.tar.zlib".to_string(),
                download_url: "https://dl.test/a".to_string(),
                size_bytes: 4096,
            }]
        );
    }

    #[test]
    fn parse_release_rejects_missing_tag() {
        let body = r#"{"assets": [{"name": "a", "browser_download_url": "u", "size": 1}]}"#;
        assert!(matches!(
            parse_release(body),
            Err(MetadataError::MissingVersion)
        ));
    }

    #[test]
    fn parse_release_rejects_missing_or_empty_assets() {
        assert!(matches!(
            parse_release(r#"{"tag_name": "1.0.0"}"#),
            Err(MetadataError::NoAssets { .. })
        ));
        assert!(matches!(
            parse_release(r#"{"tag_name": "1.0.0", "assets": []}"#),
            Err(MetadataError::NoAssets { .. })
        ));
    }

    #[test]
    fn parse_release_rejects_garbage() {
        assert!(matches!(
            parse_release("<html>rate limited</html>"),
            Err(MetadataError::Parse(_))
        ));
        assert!(matches!(
            parse_release(r#"{"tag_name": "latest", "assets": []}"#),
            Err(MetadataError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn select_asset_matches_model_suffix_case_insensitively() {
        let metadata = metadata(&[
            "esp32-firmware.tar.zlib",
            "release-PICO-firmware.tar.zlib",
            "checksums.txt",
        ]);

        let selected =
            select_asset(&metadata, "pico", DEFAULT_ASSET_PATTERN).expect("one asset matches");
        assert_eq!(selected.name, "release-PICO-firmware.tar.zlib");
    }

    #[test]
    fn select_asset_rejects_zero_matches() {
        let metadata = metadata(&["esp32-firmware.tar.zlib"]);
        assert!(matches!(
            select_asset(&metadata, "pico", DEFAULT_ASSET_PATTERN),
            Err(MetadataError::NoMatchingAsset { .. })
        ));
    }

    #[test]
    fn select_asset_rejects_ambiguous_matches() {
        let metadata = metadata(&["a-pico-firmware.tar.zlib", "b-pico-firmware.tar.zlib"]);
        let Err(MetadataError::AmbiguousAsset { names, .. }) =
            select_asset(&metadata, "pico", DEFAULT_ASSET_PATTERN)
        else {
            panic!("expected ambiguous asset error");
        };
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn update_needed_only_for_strictly_newer_remote() {
        let installed = FirmwareVersion::new(1, 2, 0);
        assert!(is_update_needed(&FirmwareVersion::new(1, 3, 0), &installed));
        assert!(!is_update_needed(&FirmwareVersion::new(1, 2, 0), &installed));
        assert!(!is_update_needed(&FirmwareVersion::new(1, 1, 9), &installed));
    }

    #[tokio::test]
    async fn fetch_latest_uses_endpoint_url() {
        let transport = FakeTransport::new().with_text(
            "https://fw.example.test/metadata.json",
            r#"{"tag_name": "2.0.1", "assets": [{"name": "x", "browser_download_url": "u", "size": 1}]}"#,
        );
        let resolver = ReleaseResolver::new(
            &transport,
            ReleaseEndpoint::Direct {
                base_url: "https://fw.example.test".to_string(),
            },
        );

        let metadata = resolver.fetch_latest().await.expect("fetch should succeed");
        assert_eq!(metadata.version, FirmwareVersion::new(2, 0, 1));
        assert_eq!(
            transport.requests(),
            vec!["https://fw.example.test/metadata.json".to_string()]
        );
    }

    #[tokio::test]
    async fn fetch_latest_reports_http_failure() {
        let transport = FakeTransport::new().with_status(
            "https://api.github.com/repos/acme/fw/releases/latest",
            reqwest::StatusCode::FORBIDDEN,
        );
        let resolver = ReleaseResolver::new(
            &transport,
            ReleaseEndpoint::GitHub {
                repo: "acme/fw".to_string(),
            },
        );

        assert!(matches!(
            resolver.fetch_latest().await,
            Err(MetadataError::Transport(_))
        ));
    }
}
