use std::time::Duration;

use ota_platform::{ConfigStore, ResetMode};

use crate::download::DEFAULT_CHUNK_SIZE;
use crate::release::{DEFAULT_ASSET_PATTERN, ReleaseEndpoint};
use crate::transport::TransportOptions;

pub const SECTION_DEVICE: &str = "DEVICE";
pub const SECTION_FIRMWARE: &str = "FIRMWARE";
pub const SECTION_SYS_FIRMWARE: &str = "SYS.FIRMWARE";
pub const SECTION_NETWORK: &str = "NETWORK";
pub const SECTION_SYS: &str = "SYS";

pub const KEY_UPDATE_ON_BOOT: &str = "UPDATE_ON_BOOT";

const DEFAULT_MODEL: &str = "generic";
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_NETWORK_WAIT_SECS: u64 = 60;

/// Update engine settings resolved from the device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSettings {
    pub device_model: String,
    pub endpoint: Option<ReleaseEndpoint>,
    pub token: Option<String>,
    pub asset_pattern: String,
    pub chunk_size: usize,
    pub max_redirects: usize,
    pub http_timeout: Duration,
    pub network_timeout: Duration,
    pub update_on_boot: bool,
    pub required_files: Vec<String>,
    pub reset_mode: ResetMode,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            device_model: DEFAULT_MODEL.to_string(),
            endpoint: None,
            token: None,
            asset_pattern: DEFAULT_ASSET_PATTERN.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            network_timeout: Duration::from_secs(DEFAULT_NETWORK_WAIT_SECS),
            update_on_boot: true,
            required_files: Vec::new(),
            reset_mode: ResetMode::default(),
        }
    }
}

impl UpdateSettings {
    /// Read settings, falling back to defaults for missing or mistyped keys.
    ///
    /// A direct `FIRMWARE/BASE_URL` takes precedence over `FIRMWARE/GITHUB_REPO`.
    #[must_use]
    pub fn from_config(config: &dyn ConfigStore) -> Self {
        let defaults = Self::default();
        let non_empty = |value: String| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        };

        let endpoint = config
            .get_str(SECTION_FIRMWARE, "BASE_URL")
            .and_then(non_empty)
            .map(|base_url| ReleaseEndpoint::Direct { base_url })
            .or_else(|| {
                config
                    .get_str(SECTION_FIRMWARE, "GITHUB_REPO")
                    .and_then(non_empty)
                    .map(|repo| ReleaseEndpoint::GitHub { repo })
            });

        Self {
            device_model: config
                .get_str(SECTION_DEVICE, "MODEL")
                .and_then(non_empty)
                .unwrap_or(defaults.device_model),
            endpoint,
            token: config
                .get_str(SECTION_FIRMWARE, "GITHUB_TOKEN")
                .and_then(non_empty),
            asset_pattern: config
                .get_str(SECTION_FIRMWARE, "ASSET_PATTERN")
                .and_then(non_empty)
                .unwrap_or(defaults.asset_pattern),
            chunk_size: config
                .get_u64(SECTION_FIRMWARE, "CHUNK_SIZE")
                .and_then(|value| usize::try_from(value).ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.chunk_size),
            max_redirects: config
                .get_u64(SECTION_FIRMWARE, "MAX_REDIRECTS")
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(defaults.max_redirects),
            http_timeout: config
                .get_u64(SECTION_FIRMWARE, "HTTP_TIMEOUT_SECS")
                .filter(|value| *value > 0)
                .map_or(defaults.http_timeout, Duration::from_secs),
            network_timeout: config
                .get_u64(SECTION_NETWORK, "WAIT_TIMEOUT_SECS")
                .map_or(defaults.network_timeout, Duration::from_secs),
            update_on_boot: config
                .get_bool(SECTION_SYS_FIRMWARE, KEY_UPDATE_ON_BOOT)
                .unwrap_or(defaults.update_on_boot),
            required_files: config
                .get_list(SECTION_FIRMWARE, "REQUIRED_FILES")
                .unwrap_or(defaults.required_files),
            reset_mode: config
                .get_str(SECTION_SYS, "RESET_MODE")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.reset_mode),
        }
    }

    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: self.http_timeout,
            max_redirects: self.max_redirects,
            token: self.token.clone(),
        }
    }
}
