//! Durable per-device usage counters.
//!
//! One record per device, `_client:<device id>`, holding two monotonically
//! increasing counters (`bytesIn`, `bytesOut`) and an expiry at the end of
//! the billing month. Records that outlive their expiry because of clock
//! skew are swept by an external job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("usage store unavailable: {0}")]
    Unavailable(String),
}

/// Cumulative counters after an increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub bytes_in: i64,
    pub bytes_out: i64,
}

impl Counters {
    pub fn total(&self) -> u64 {
        (self.bytes_in.max(0) as u64).saturating_add(self.bytes_out.max(0) as u64)
    }
}

/// Atomic increment-with-expiry storage.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Add the deltas to the device's counters and set the record to expire
    /// at `expire_at`, as one atomic operation. Returns the new totals.
    async fn increment(
        &self,
        device_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        expire_at: DateTime<Utc>,
    ) -> Result<Counters, StoreError>;
}

pub fn client_key(device_id: &str) -> String {
    format!("_client:{}", device_id)
}

/// Redis-backed store using `MULTI`/`EXEC` transactions.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        tracing::info!("Connected to redis usage store");
        Ok(Self { connection })
    }
}

#[async_trait]
impl UsageStore for RedisStore {
    async fn increment(
        &self,
        device_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        expire_at: DateTime<Utc>,
    ) -> Result<Counters, StoreError> {
        let key = client_key(device_id);
        let mut conn = self.connection.clone();
        let (bytes_in, bytes_out): (i64, i64) = redis::pipe()
            .atomic()
            .hincr(&key, "bytesIn", clamp(bytes_in))
            .hincr(&key, "bytesOut", clamp(bytes_out))
            .expire_at(&key, expire_at.timestamp())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(Counters { bytes_in, bytes_out })
    }
}

fn clamp(delta: u64) -> i64 {
    i64::try_from(delta).unwrap_or(i64::MAX)
}

/// In-process store for tests and deployments without redis.
/// Counters do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, (Counters, DateTime<Utc>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<(Counters, DateTime<Utc>)> {
        self.records.get(&client_key(device_id)).map(|r| *r.value())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn increment(
        &self,
        device_id: &str,
        bytes_in: u64,
        bytes_out: u64,
        expire_at: DateTime<Utc>,
    ) -> Result<Counters, StoreError> {
        let mut record = self
            .records
            .entry(client_key(device_id))
            .or_insert_with(|| (Counters::default(), expire_at));
        let (counters, expiry) = record.value_mut();
        counters.bytes_in = counters.bytes_in.saturating_add(clamp(bytes_in));
        counters.bytes_out = counters.bytes_out.saturating_add(clamp(bytes_out));
        *expiry = expire_at;
        Ok(*counters)
    }
}
