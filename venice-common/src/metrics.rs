//! Metrics and observability for the ingestion core.
#![allow(clippy::non_std_lazy_statics)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

/// Global metrics registry.
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub struct MetricsRegistry {
    start_time: Instant,
    custom_metrics: RwLock<Vec<CustomMetric>>,
}

struct CustomMetric {
    name: String,
    value: f64,
    #[allow(dead_code)]
    labels: Vec<(String, String)>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            custom_metrics: RwLock::new(Vec::new()),
        }
    }

    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(&METRICS)
    }

    pub fn record(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut metrics = self.custom_metrics.write();
        metrics.push(CustomMetric {
            name: name.to_string(),
            value,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), (*v).to_string()))
                .collect(),
        });
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Ingestion metrics
// ============================================================================

/// A record was read off the shared consumer pool for a partition.
pub fn record_records_in(topic: &str, partition: i32, count: u64) {
    counter!("venice_records_in_total",
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    )
    .increment(count);
}

/// A record was applied to the local store.
pub fn record_records_persisted(store_version: &str, partition: i32, count: u64, bytes: u64) {
    counter!("venice_records_persisted_total",
        "store_version" => store_version.to_string(),
        "partition" => partition.to_string()
    )
    .increment(count);
    counter!("venice_bytes_persisted_total",
        "store_version" => store_version.to_string(),
        "partition" => partition.to_string()
    )
    .increment(bytes);
}

/// A record was dropped by DIV as a duplicate.
pub fn record_duplicate_dropped(store_version: &str, partition: i32) {
    counter!("venice_records_dropped_duplicate_total",
        "store_version" => store_version.to_string(),
        "partition" => partition.to_string()
    )
    .increment(1);
}

/// A rewind (TopicSwitch / StartOfBufferReplay) was applied.
pub fn record_rewind_triggered(store_version: &str, partition: i32) {
    counter!("venice_rewind_triggered_total",
        "store_version" => store_version.to_string(),
        "partition" => partition.to_string()
    )
    .increment(1);
}

/// Set the current role of a partition ingestor (1 = leader, 0 = follower).
pub fn set_partition_is_leader(store_version: &str, partition: i32, is_leader: bool) {
    gauge!("venice_partition_is_leader",
        "store_version" => store_version.to_string(),
        "partition" => partition.to_string()
    )
    .set(if is_leader { 1.0 } else { 0.0 });
}

/// Set a partition's local version-topic offset lag behind the observed
/// upstream high watermark.
pub fn set_offset_lag(store_version: &str, partition: i32, lag: i64) {
    gauge!("venice_offset_lag",
        "store_version" => store_version.to_string(),
        "partition" => partition.to_string()
    )
    .set(lag as f64);
}

/// Record a local-store or version-topic-produce commit latency.
pub fn record_commit_latency(stage: &str, latency_us: f64) {
    histogram!("venice_commit_duration_us", "stage" => stage.to_string()).record(latency_us);
}

/// Shared consumer pool occupancy.
pub fn set_consumer_pool_gauges(active: i64, paused: i64) {
    gauge!("venice_consumer_pool_active_subscriptions").set(active as f64);
    gauge!("venice_consumer_pool_paused_subscriptions").set(paused as f64);
}

// ============================================================================
// Export
// ============================================================================

#[must_use]
pub fn export_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    let registry = MetricsRegistry::global();
    let uptime = format!(
        "# HELP venice_uptime_seconds Server uptime in seconds\n\
         # TYPE venice_uptime_seconds gauge\n\
         venice_uptime_seconds {}\n",
        registry.uptime_secs()
    );

    let metrics_str = String::from_utf8(buffer).unwrap_or_default();
    format!("{uptime}{metrics_str}")
}

/// RAII guard recording elapsed time into the registry on drop.
pub struct LatencyTimer {
    start: Instant,
    metric_name: String,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(metric_name: &str) -> Self {
        Self {
            start: Instant::now(),
            metric_name: metric_name.to_string(),
        }
    }

    #[must_use]
    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1_000_000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        let latency = self.elapsed_us();
        MetricsRegistry::global().record(&self.metric_name, latency, &[]);
    }
}
