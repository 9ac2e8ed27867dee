//! Latest known usage per device, for other parts of the proxy to consult.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Cumulative bytes for a device this billing month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceUsage {
    pub bytes: u64,
    pub as_of: DateTime<Utc>,
}

/// A thread-safe map of device id to its last reported usage.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    inner: Arc<DashMap<String, DeviceUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, device_id: &str, bytes: u64, as_of: DateTime<Utc>) {
        self.inner.insert(device_id.to_string(), DeviceUsage { bytes, as_of });
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceUsage> {
        self.inner.get(device_id).map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
