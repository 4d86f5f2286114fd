//! Per-operation latency accounting, slow-query logging, and threshold
//! alerts.
//!
//! Every data-layer and search operation records its latency, row count,
//! and error flag here. Percentiles come from a fixed log-scale histogram;
//! alerts evaluate over a rolling one-minute window and are rate-limited
//! by a per-kind cooldown so a sustained incident logs once per window,
//! not once per query.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::config::MonitoringConfig;

/// Upper bounds of the latency histogram buckets, in milliseconds. The
/// final bucket is unbounded.
const BUCKET_BOUNDS_MS: [u64; 14] = [
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000,
];

const WINDOW: Duration = Duration::from_secs(60);
const ALERT_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// Error-rate alert threshold over the rolling window.
const ERROR_RATE_THRESHOLD: f64 = 0.05;
/// Queries-per-second alert cap over the rolling window.
const DEFAULT_QPS_CAP: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertKind {
    SlowLatency,
    ErrorRate,
    Throughput,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Histogram {
    counts: Vec<u64>,
    total: u64,
}

impl Histogram {
    fn new() -> Self {
        Histogram {
            counts: vec![0; BUCKET_BOUNDS_MS.len() + 1],
            total: 0,
        }
    }

    fn record(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.counts[bucket] += 1;
        self.total += 1;
    }

    /// Percentile estimate: the upper bound of the bucket holding the
    /// requested rank. `q` in (0, 1].
    pub fn percentile_ms(&self, q: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        let rank = ((self.total as f64) * q).ceil() as u64;
        let mut seen = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return BUCKET_BOUNDS_MS
                    .get(i)
                    .copied()
                    .unwrap_or(*BUCKET_BOUNDS_MS.last().unwrap_or(&0));
            }
        }
        *BUCKET_BOUNDS_MS.last().unwrap_or(&0)
    }
}

struct WindowSample {
    at: Instant,
    latency: Duration,
    error: bool,
}

struct OpStats {
    histogram: Histogram,
    total_calls: u64,
    total_errors: u64,
    total_rows: u64,
    window: VecDeque<WindowSample>,
    last_alert: FxHashMap<AlertKind, Instant>,
}

impl OpStats {
    fn new() -> Self {
        OpStats {
            histogram: Histogram::new(),
            total_calls: 0,
            total_errors: 0,
            total_rows: 0,
            window: VecDeque::new(),
            last_alert: FxHashMap::default(),
        }
    }

    fn trim_window(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot of one operation's counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct OpSnapshot {
    pub operation: String,
    pub calls: u64,
    pub errors: u64,
    pub rows: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

pub struct PerfMonitor {
    enabled: bool,
    slow_threshold: Duration,
    qps_cap: f64,
    ops: Mutex<FxHashMap<String, OpStats>>,
}

impl PerfMonitor {
    pub fn new(config: &MonitoringConfig) -> Self {
        PerfMonitor {
            enabled: config.monitoring_enabled,
            slow_threshold: config.slow_query_threshold,
            qps_cap: DEFAULT_QPS_CAP,
            ops: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_qps_cap(mut self, cap: f64) -> Self {
        self.qps_cap = cap;
        self
    }

    /// Records one operation outcome and evaluates the alert thresholds.
    pub fn record(&self, operation: &str, latency: Duration, rows: usize, error: bool) {
        if !self.enabled {
            return;
        }
        if latency >= self.slow_threshold {
            tracing::warn!(
                operation,
                latency_ms = latency.as_millis() as u64,
                rows,
                "slow query"
            );
        }

        let now = Instant::now();
        let mut ops = self.ops.lock();
        let stats = ops
            .entry(operation.to_string())
            .or_insert_with(OpStats::new);
        stats.histogram.record(latency);
        stats.total_calls += 1;
        stats.total_rows += rows as u64;
        if error {
            stats.total_errors += 1;
        }
        stats.window.push_back(WindowSample {
            at: now,
            latency,
            error,
        });
        stats.trim_window(now);

        let window_len = stats.window.len() as f64;
        let window_errors = stats.window.iter().filter(|s| s.error).count() as f64;

        // Alerts evaluate the rolling window, not the lifetime histogram.
        let mut window_latencies: Vec<Duration> =
            stats.window.iter().map(|s| s.latency).collect();
        window_latencies.sort();
        let rank = ((window_latencies.len() as f64) * 0.95).ceil() as usize;
        let window_p95 = window_latencies
            .get(rank.saturating_sub(1))
            .copied()
            .unwrap_or_default();
        if window_p95 > self.slow_threshold {
            let p95_ms = window_p95.as_millis() as u64;
            Self::alert(stats, AlertKind::SlowLatency, now, || {
                tracing::warn!(operation, p95_ms, "p95 latency over threshold");
            });
        }
        if window_len >= 20.0 && window_errors / window_len > ERROR_RATE_THRESHOLD {
            Self::alert(stats, AlertKind::ErrorRate, now, || {
                tracing::warn!(
                    operation,
                    error_rate = window_errors / window_len,
                    "error rate over threshold"
                );
            });
        }
        if window_len / WINDOW.as_secs_f64() > self.qps_cap {
            Self::alert(stats, AlertKind::Throughput, now, || {
                tracing::warn!(operation, qps_cap = self.qps_cap, "query rate over cap");
            });
        }
    }

    fn alert(stats: &mut OpStats, kind: AlertKind, now: Instant, emit: impl FnOnce()) {
        let due = stats
            .last_alert
            .get(&kind)
            .is_none_or(|last| now.duration_since(*last) >= ALERT_COOLDOWN);
        if due {
            stats.last_alert.insert(kind, now);
            emit();
        }
    }

    /// Convenience wrapper timing a fallible async operation.
    pub async fn observe<T, E, F>(&self, operation: &str, fut: F) -> Result<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record(operation, started.elapsed(), 0, result.is_err());
        result
    }

    pub fn snapshot(&self) -> Vec<OpSnapshot> {
        let ops = self.ops.lock();
        let mut out: Vec<OpSnapshot> = ops
            .iter()
            .map(|(name, stats)| OpSnapshot {
                operation: name.clone(),
                calls: stats.total_calls,
                errors: stats.total_errors,
                rows: stats.total_rows,
                p50_ms: stats.histogram.percentile_ms(0.50),
                p95_ms: stats.histogram.percentile_ms(0.95),
                p99_ms: stats.histogram.percentile_ms(0.99),
            })
            .collect();
        out.sort_by(|a, b| a.operation.cmp(&b.operation));
        out
    }
}
