use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Traffic and latency counters for a client, a server or a single session.
///
/// Each counter is an independent atomic. Recording takes a shared lock on
/// the start timestamp, and [`reset`](Self::reset) takes it exclusively, so a
/// reset never interleaves with a half-applied update or a summary.
#[derive(Debug)]
pub struct PerformanceMetrics {
    start_time: RwLock<Instant>,
    request_count: AtomicU64,
    response_count: AtomicU64,
    error_count: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latencies: Mutex<Vec<f64>>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_METRICS: Lazy<Arc<PerformanceMetrics>> =
    Lazy::new(|| Arc::new(PerformanceMetrics::new()));

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(Instant::now()),
            request_count: AtomicU64::new(0),
            response_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Process-wide aggregate, for callers that explicitly want one
    pub fn global() -> Arc<Self> {
        GLOBAL_METRICS.clone()
    }

    pub fn record_request(&self) {
        let _guard = self.start_time.read();
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, latency_ms: f64) {
        let _guard = self.start_time.read();
        self.response_count.fetch_add(1, Ordering::Relaxed);
        self.latencies.lock().push(latency_ms);
    }

    /// Count an inbound message that answers no outstanding request
    pub fn record_unmatched_response(&self) {
        let _guard = self.start_time.read();
        self.response_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        let _guard = self.start_time.read();
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, n: usize) {
        let _guard = self.start_time.read();
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, n: usize) {
        let _guard = self.start_time.read();
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Zero every counter, clear latencies and restart the uptime clock
    pub fn reset(&self) {
        let mut start = self.start_time.write();
        self.request_count.store(0, Ordering::Relaxed);
        self.response_count.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.latencies.lock().clear();
        *start = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn response_count(&self) -> u64 {
        self.response_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.read().elapsed().as_secs_f64()
    }

    /// Mean of recorded latencies; `0.0` when none were recorded
    pub fn average_latency_ms(&self) -> f64 {
        mean(&self.latencies.lock())
    }

    pub fn min_latency_ms(&self) -> f64 {
        LatencyStats::from(&*self.latencies.lock()).min
    }

    pub fn max_latency_ms(&self) -> f64 {
        LatencyStats::from(&*self.latencies.lock()).max
    }

    /// Recorded latencies in insertion order
    pub fn latencies(&self) -> Vec<f64> {
        self.latencies.lock().clone()
    }

    /// `errors / requests`; `0.0` when no request was recorded
    pub fn error_rate(&self) -> f64 {
        let _guard = self.start_time.read();
        ratio(self.error_count(), self.request_count())
    }

    /// Average send/receive bandwidth since the start timestamp; `0.0` when no
    /// time has elapsed
    pub fn bandwidth_mbps(&self) -> Bandwidth {
        let start = self.start_time.read();
        Bandwidth::over(
            self.bytes_sent(),
            self.bytes_received(),
            start.elapsed().as_secs_f64(),
        )
    }

    /// Snapshot of every counter and derived value taken under one shared lock
    pub fn summary(&self) -> MetricsSummary {
        let start = self.start_time.read();
        let request_count = self.request_count();
        let response_count = self.response_count();
        let error_count = self.error_count();
        let bytes_sent = self.bytes_sent();
        let bytes_received = self.bytes_received();
        let uptime_seconds = start.elapsed().as_secs_f64();
        let latency = LatencyStats::from(&*self.latencies.lock());
        let bandwidth = Bandwidth::over(bytes_sent, bytes_received, uptime_seconds);

        MetricsSummary {
            request_count,
            response_count,
            error_count,
            bytes_sent,
            bytes_received,
            uptime_seconds,
            average_latency_ms: latency.mean,
            min_latency_ms: latency.min,
            max_latency_ms: latency.max,
            error_rate: ratio(error_count, request_count),
            sent_mbps: bandwidth.sent_mbps,
            received_mbps: bandwidth.received_mbps,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

struct LatencyStats {
    mean: f64,
    min: f64,
    max: f64,
}

impl From<&Vec<f64>> for LatencyStats {
    fn from(values: &Vec<f64>) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, min: 0.0, max: 0.0 };
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            mean: mean(values),
            min,
            max,
        }
    }
}

/// Megabits per second in each direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bandwidth {
    pub sent_mbps: f64,
    pub received_mbps: f64,
}

impl Bandwidth {
    fn over(bytes_sent: u64, bytes_received: u64, seconds: f64) -> Self {
        if seconds <= 0.0 {
            return Self { sent_mbps: 0.0, received_mbps: 0.0 };
        }
        Self {
            sent_mbps: bytes_sent as f64 * 8.0 / 1e6 / seconds,
            received_mbps: bytes_received as f64 * 8.0 / 1e6 / seconds,
        }
    }
}

/// Immutable snapshot of [`PerformanceMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub request_count: u64,
    pub response_count: u64,
    pub error_count: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime_seconds: f64,
    pub average_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub error_rate: f64,
    pub sent_mbps: f64,
    pub received_mbps: f64,
}

impl MetricsSummary {
    /// Flat name → value mapping for hosts that want a dictionary
    pub fn to_map(&self) -> HashMap<String, f64> {
        let mut map = HashMap::new();
        map.insert("request_count".to_string(), self.request_count as f64);
        map.insert("response_count".to_string(), self.response_count as f64);
        map.insert("error_count".to_string(), self.error_count as f64);
        map.insert("bytes_sent".to_string(), self.bytes_sent as f64);
        map.insert("bytes_received".to_string(), self.bytes_received as f64);
        map.insert("uptime_seconds".to_string(), self.uptime_seconds);
        map.insert("average_latency_ms".to_string(), self.average_latency_ms);
        map.insert("min_latency_ms".to_string(), self.min_latency_ms);
        map.insert("max_latency_ms".to_string(), self.max_latency_ms);
        map.insert("error_rate".to_string(), self.error_rate);
        map.insert("sent_mbps".to_string(), self.sent_mbps);
        map.insert("received_mbps".to_string(), self.received_mbps);
        map
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Performance Metrics ---")?;
        writeln!(f, "Traffic:")?;
        writeln!(f, "  Requests: {} / {} bytes sent", self.request_count, self.bytes_sent)?;
        writeln!(f, "  Responses: {} / {} bytes received", self.response_count, self.bytes_received)?;
        writeln!(f, "  Bandwidth: {:.3} Mbps out / {:.3} Mbps in", self.sent_mbps, self.received_mbps)?;
        writeln!(f, "Latency:")?;
        writeln!(
            f,
            "  avg {:.3} ms (min {:.3}, max {:.3})",
            self.average_latency_ms, self.min_latency_ms, self.max_latency_ms
        )?;
        writeln!(f, "Errors:")?;
        writeln!(f, "  Errors: {} (rate {:.4})", self.error_count, self.error_rate)?;
        writeln!(f, "Uptime: {:.1} s", self.uptime_seconds)?;
        Ok(())
    }
}
