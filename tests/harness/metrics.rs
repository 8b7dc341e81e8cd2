//! Counters shared by the tasks of a concurrency test.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    sessions_failed: AtomicUsize,
    payloads_sent: AtomicUsize,
    payloads_verified: AtomicUsize,
    bytes_relayed: AtomicU64,
}

/// Cheaply clonable handle to a set of atomic counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session(&self) {
        self.inner.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.inner.payloads_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verified(&self, bytes: usize) {
        self.inner.payloads_verified.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> usize {
        self.inner.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> usize {
        self.inner.payloads_sent.load(Ordering::Relaxed)
    }

    pub fn verified(&self) -> usize {
        self.inner.payloads_verified.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.inner.bytes_relayed.load(Ordering::Relaxed)
    }
}

/// Round-trip samples collected across tasks.
#[derive(Debug, Clone, Default)]
pub struct Latencies {
    samples: Arc<Mutex<Vec<Duration>>>,
}

impl Latencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: Duration) {
        self.samples.lock().unwrap().push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    /// Sample at the given percentile (0..=100), or zero with no samples.
    pub fn percentile(&self, pct: usize) -> Duration {
        let mut samples = self.samples.lock().unwrap().clone();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.sort_unstable();
        let idx = (samples.len() - 1) * pct.min(100) / 100;
        samples[idx]
    }
}
