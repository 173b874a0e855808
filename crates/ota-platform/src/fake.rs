//! Deterministic stand-ins for the device capabilities, for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ConfigError, ConfigStore};
use crate::network::NetworkManager;
use crate::reset::ResetPrimitive;

/// Network whose readiness is fixed up front.
pub struct FakeNetwork {
    reachable: AtomicBool,
    up_calls: AtomicUsize,
}

impl FakeNetwork {
    #[must_use]
    pub fn reachable() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            up_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            reachable: AtomicBool::new(false),
            up_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn up_calls(&self) -> usize {
        self.up_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkManager for FakeNetwork {
    fn up(&self) {
        self.up_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn wait_until_up(&self, _timeout: Duration) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn ip_address(&self) -> Option<String> {
        self.reachable
            .load(Ordering::SeqCst)
            .then(|| "192.0.2.10".to_string())
    }
}

/// In-memory configuration.
#[derive(Default)]
pub struct MemoryConfigStore {
    values: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(self, section: &str, key: &str, value: Value) -> Self {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((section.to_string(), key.to_string()), value);
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, section: &str, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(section.to_string(), key.to_string()))
            .cloned()
    }

    fn set(&self, section: &str, key: &str, value: Value) -> Result<(), ConfigError> {
        self.values
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((section.to_string(), key.to_string()), value);
        Ok(())
    }
}

/// Reset that only counts how often it was triggered.
#[derive(Default)]
pub struct FakeReset {
    resets: AtomicUsize,
}

impl FakeReset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl ResetPrimitive for FakeReset {
    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
