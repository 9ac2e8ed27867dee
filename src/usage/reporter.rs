//! Per-device bandwidth aggregation.
//!
//! # Data Flow
//! ```text
//! connection finishes
//!     → UsageHandle::record (try_send, never blocks; dropped when full)
//!     → bounded channel
//!     → UsageReporter task (single owner of the per-device totals)
//!     → every interval: flush to the UsageStore, then reset
//! ```
//!
//! # Design Decisions
//! - The totals map lives inside the reporter task only; the channel is
//!   the sole synchronization point
//! - Samples are shed under backpressure instead of slowing requests
//! - Startup is delayed by a random amount within a minute so many proxies
//!   sharing one store do not flush in lockstep
//! - Flush failures are never retried; [`FlushPolicy`] decides whether the
//!   rest of the pass is attempted

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::UsageConfig;
use crate::observability::metrics;
use crate::usage::store::{StoreError, UsageStore};
use crate::usage::tracker::UsageTracker;

/// Default ingestion queue capacity.
pub const QUEUE_CAPACITY: usize = 10_000;

/// Upper bound of the random startup delay.
pub const MAX_STARTUP_JITTER: Duration = Duration::from_secs(60);

/// Traffic for one finished connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSample {
    pub device_id: Option<String>,
    /// Bytes written to the client.
    pub sent: u64,
    /// Bytes read from the client.
    pub recv: u64,
}

/// Accumulated traffic for one device since the last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceTotals {
    pub sent: u64,
    pub recv: u64,
}

/// What a flush pass does after a device's write fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Stop the pass. Deltas of devices not yet written are lost, since the
    /// totals are reset after every pass.
    #[default]
    AbortOnError,
    /// Log the failure and keep writing the remaining devices.
    ContinueOnError,
}

impl FlushPolicy {
    fn continue_after(&self, _error: &StoreError) -> bool {
        matches!(self, FlushPolicy::ContinueOnError)
    }
}

/// Producer side, cloned into every connection handler.
#[derive(Debug, Clone)]
pub struct UsageHandle {
    tx: mpsc::Sender<UsageSample>,
}

impl UsageHandle {
    /// Queue a sample without waiting. Returns false when it was dropped.
    pub fn record(&self, sample: UsageSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(sample)) => {
                tracing::debug!(device_id = ?sample.device_id, "Usage queue full, dropping sample");
                metrics::record_usage_sample_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// The aggregation task.
pub struct UsageReporter {
    rx: mpsc::Receiver<UsageSample>,
    store: Arc<dyn UsageStore>,
    tracker: UsageTracker,
    interval: Duration,
    startup_jitter: Duration,
    policy: FlushPolicy,
}

impl UsageReporter {
    /// Create the reporter and the handle that feeds it.
    pub fn new(store: Arc<dyn UsageStore>, tracker: UsageTracker, config: &UsageConfig) -> (UsageHandle, Self) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let reporter = Self {
            rx,
            store,
            tracker,
            interval: Duration::from_secs(config.report_interval_secs.max(1)),
            startup_jitter: MAX_STARTUP_JITTER,
            policy: config.flush_policy,
        };
        (UsageHandle { tx }, reporter)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Upper bound of the random startup delay; zero disables it.
    pub fn with_startup_jitter(mut self, jitter: Duration) -> Self {
        self.startup_jitter = jitter;
        self
    }

    pub fn with_policy(mut self, policy: FlushPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[cfg(test)]
    pub(crate) async fn next_sample(&mut self) -> Option<UsageSample> {
        self.rx.recv().await
    }

    /// Run until shutdown or until every handle is dropped. Whatever has been
    /// accumulated is flushed one last time on the way out.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let delay = random_delay(self.startup_jitter);
        tracing::debug!(delay = ?delay, "Randomly sleeping before reporting traffic");
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = shutdown.recv() => {
                tracing::info!("Usage reporter stopped before first report");
                return;
            }
        }

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut totals: HashMap<String, DeviceTotals> = HashMap::new();

        loop {
            tokio::select! {
                sample = self.rx.recv() => match sample {
                    Some(sample) => accumulate(&mut totals, sample),
                    None => {
                        tracing::info!("Usage handles dropped, reporter exiting");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(&mut totals).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Usage reporter received shutdown signal, exiting loop");
                    break;
                }
            }
            metrics::record_usage_pending_devices(totals.len());
        }

        while let Ok(sample) = self.rx.try_recv() {
            accumulate(&mut totals, sample);
        }
        self.flush(&mut totals).await;
    }

    /// Write every device's deltas, then reset the totals whatever happened.
    async fn flush(&self, totals: &mut HashMap<String, DeviceTotals>) {
        if totals.is_empty() {
            return;
        }
        let started = Instant::now();
        let now = Utc::now();
        let expire_at = end_of_month(now);
        tracing::trace!(devices = totals.len(), "Submitting usage");

        for (device_id, delta) in totals.iter() {
            match self.store.increment(device_id, delta.recv, delta.sent, expire_at).await {
                Ok(counters) => self.tracker.set(device_id, counters.total(), now),
                Err(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "Unable to submit usage");
                    metrics::record_usage_flush_error();
                    if !self.policy.continue_after(&e) {
                        break;
                    }
                }
            }
        }

        totals.clear();
        metrics::record_usage_flush(started.elapsed());
    }
}

fn accumulate(totals: &mut HashMap<String, DeviceTotals>, sample: UsageSample) {
    let Some(device_id) = sample.device_id else {
        return;
    };
    let entry = totals.entry(device_id).or_default();
    entry.sent = entry.sent.saturating_add(sample.sent);
    entry.recv = entry.recv.saturating_add(sample.recv);
}

fn random_delay(max: Duration) -> Duration {
    let max_nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..max_nanos))
}

/// Last second of the calendar month containing `now`.
pub fn end_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.and_hms_opt(0, 0, 0))
        .map(|start| Utc.from_utc_datetime(&start) - chrono::Duration::seconds(1))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::store::{Counters, MemoryStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn config() -> UsageConfig {
        UsageConfig {
            queue_capacity: 16,
            ..UsageConfig::default()
        }
    }

    fn sample(device: Option<&str>, sent: u64, recv: u64) -> UsageSample {
        UsageSample {
            device_id: device.map(str::to_string),
            sent,
            recv,
        }
    }

    /// Fails for the devices listed, records every attempt.
    #[derive(Default)]
    struct FlakyStore {
        failing: Vec<&'static str>,
        attempts: Mutex<Vec<String>>,
        inner: MemoryStore,
    }

    #[async_trait]
    impl UsageStore for FlakyStore {
        async fn increment(
            &self,
            device_id: &str,
            bytes_in: u64,
            bytes_out: u64,
            expire_at: DateTime<Utc>,
        ) -> Result<Counters, StoreError> {
            self.attempts.lock().unwrap().push(device_id.to_string());
            if self.failing.contains(&device_id) {
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.inner.increment(device_id, bytes_in, bytes_out, expire_at).await
        }
    }

    #[test]
    fn end_of_month_rolls_over_december() {
        let dec = Utc.with_ymd_and_hms(2023, 12, 15, 8, 0, 0).unwrap();
        assert_eq!(end_of_month(dec), Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap());

        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(end_of_month(feb), Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap());
    }

    #[test]
    fn accumulate_is_additive_and_skips_anonymous() {
        let mut totals = HashMap::new();
        accumulate(&mut totals, sample(Some("a"), 10, 1));
        accumulate(&mut totals, sample(Some("a"), 10, 1));
        accumulate(&mut totals, sample(None, 999, 999));
        assert_eq!(totals.len(), 1);
        assert_eq!(totals["a"], DeviceTotals { sent: 20, recv: 2 });
    }

    #[tokio::test]
    async fn flush_writes_deltas_and_resets() {
        let store = Arc::new(MemoryStore::new());
        let tracker = UsageTracker::new();
        let (_handle, reporter) = UsageReporter::new(store.clone(), tracker.clone(), &config());

        let mut totals = HashMap::new();
        accumulate(&mut totals, sample(Some("a"), 100, 7));
        reporter.flush(&mut totals).await;

        assert!(totals.is_empty());
        let (counters, expiry) = store.get("a").unwrap();
        // bytesIn counts what the client sent us, bytesOut what we sent it.
        assert_eq!(counters, Counters { bytes_in: 7, bytes_out: 100 });
        assert_eq!(expiry, end_of_month(Utc::now()));
        assert_eq!(tracker.get("a").unwrap().bytes, 107);
    }

    #[tokio::test]
    async fn empty_flush_touches_nothing() {
        let store = Arc::new(FlakyStore::default());
        let (_handle, reporter) = UsageReporter::new(store.clone(), UsageTracker::new(), &config());
        reporter.flush(&mut HashMap::new()).await;
        assert!(store.attempts.lock().unwrap().is_empty());
    }

    // Aborting on the first failure discards the deltas of devices not yet
    // written in that pass.
    #[tokio::test]
    async fn abort_policy_stops_at_first_failure() {
        let store = Arc::new(FlakyStore {
            failing: vec!["a", "b", "c"],
            ..FlakyStore::default()
        });
        let (_handle, reporter) = UsageReporter::new(store.clone(), UsageTracker::new(), &config());

        let mut totals = HashMap::new();
        for device in ["a", "b", "c"] {
            accumulate(&mut totals, sample(Some(device), 1, 1));
        }
        reporter.flush(&mut totals).await;

        assert_eq!(store.attempts.lock().unwrap().len(), 1);
        assert!(totals.is_empty());
    }

    #[tokio::test]
    async fn continue_policy_attempts_every_device() {
        let store = Arc::new(FlakyStore {
            failing: vec!["b"],
            ..FlakyStore::default()
        });
        let tracker = UsageTracker::new();
        let (_handle, reporter) = UsageReporter::new(store.clone(), tracker.clone(), &config());
        let reporter = reporter.with_policy(FlushPolicy::ContinueOnError);

        let mut totals = HashMap::new();
        for device in ["a", "b", "c"] {
            accumulate(&mut totals, sample(Some(device), 1, 1));
        }
        reporter.flush(&mut totals).await;

        assert_eq!(store.attempts.lock().unwrap().len(), 3);
        assert!(tracker.get("a").is_some());
        assert!(tracker.get("b").is_none());
        assert!(tracker.get("c").is_some());
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let config = UsageConfig {
            queue_capacity: 2,
            ..UsageConfig::default()
        };
        let (handle, _reporter) = UsageReporter::new(Arc::new(MemoryStore::new()), UsageTracker::new(), &config);

        assert!(handle.record(sample(Some("a"), 1, 1)));
        assert!(handle.record(sample(Some("a"), 1, 1)));
        assert!(!handle.record(sample(Some("a"), 1, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let (handle, reporter) = UsageReporter::new(store.clone(), UsageTracker::new(), &config());
        let reporter = reporter
            .with_interval(Duration::from_secs(10))
            .with_startup_jitter(Duration::ZERO);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(reporter.run(shutdown_rx));

        handle.record(sample(Some("dev"), 5, 3));
        handle.record(sample(Some("dev"), 5, 3));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.get("dev").is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.get("dev").unwrap().0, Counters { bytes_in: 6, bytes_out: 10 });

        // Nothing new: the next tick must not change the counters.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.get("dev").unwrap().0, Counters { bytes_in: 6, bytes_out: 10 });

        handle.record(sample(Some("dev"), 1, 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(store.get("dev").unwrap().0, Counters { bytes_in: 7, bytes_out: 11 });
    }
}
