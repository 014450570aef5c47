// Telemetry: tracing initialisation and per-source fetch metrics
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,vigil_core=info";

/// Initialize the global tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_filter`. Safe to call more than
/// once; later calls leave the existing subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let initialized = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if initialized {
        info!(target: "telemetry", filter = %default_filter, "Tracing initialized");
    }
}

/// Per-source fetch statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub attempts: u64,
    pub failures: u64,
    pub discarded: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: f64,
}

impl SourceStats {
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }
}

/// Fetch metrics collector, shared by clones
#[derive(Debug, Clone, Default)]
pub struct FetchMetrics {
    stats: Arc<DashMap<String, SourceStats>>,
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed fetch
    pub fn record_fetch(&self, source: &str, latency: Duration, ok: bool) {
        let latency_ms = latency.as_millis() as u64;
        self.update(source, |stats| {
            stats.attempts += 1;
            if !ok {
                stats.failures += 1;
            }
            stats.last_latency_ms = latency_ms;
            // Running mean over all attempts
            let n = stats.attempts as f64;
            stats.avg_latency_ms += (latency_ms as f64 - stats.avg_latency_ms) / n;
        });
    }

    /// Record a completion that arrived after it was superseded
    pub fn record_discarded(&self, source: &str) {
        self.update(source, |stats| stats.discarded += 1);
    }

    pub fn get(&self, source: &str) -> Option<SourceStats> {
        self.stats.get(source).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<(String, SourceStats)> {
        let mut all: Vec<(String, SourceStats)> = self
            .stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Print metrics to log
    pub fn log_summary(&self) {
        for (source, stats) in self.snapshot() {
            info!(
                target: "telemetry",
                source = %source,
                attempts = stats.attempts,
                failures = stats.failures,
                discarded = stats.discarded,
                avg_latency_ms = format!("{:.1}", stats.avg_latency_ms),
                "Fetch metrics"
            );
        }
    }

    fn update<F>(&self, source: &str, f: F)
    where
        F: FnOnce(&mut SourceStats),
    {
        let mut entry = self
            .stats
            .entry(source.to_string())
            .or_insert_with(SourceStats::default);
        f(entry.value_mut());
    }
}
