//! Device-side capabilities consumed by the update engine.
//!
//! Everything that touches hardware, the network link, or persisted device
//! configuration sits behind a small trait here so the engine can run against
//! the real device or against deterministic fakes:
//! - Device root layout and reserved file names.
//! - Sectioned JSON configuration store.
//! - Network link monitoring with a polled readiness wait.
//! - Hard reset.

mod config;
mod fsutil;
mod network;
mod paths;
mod reset;

#[cfg(any(test, feature = "fakes"))]
pub mod fake;

pub use config::{ConfigError, ConfigStore, JsonConfigStore};
pub use fsutil::write_atomic;
pub use network::{LinkMonitor, LinkStatus, NetworkManager};
pub use paths::{DevicePaths, DevicePathsError};
pub use reset::{ResetMode, ResetPrimitive, SystemReset};
