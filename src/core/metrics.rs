// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the cluster monitors.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, GaugeVec, HistogramVec, TextEncoder, register_counter_vec, register_gauge_vec,
    register_histogram_vec,
};
use tracing::error;

lazy_static! {
    // --- Per-cluster Gauges ---
    /// Servers currently marked DOWN, per cluster.
    pub static ref SERVERS_DOWN: GaugeVec =
        register_gauge_vec!("replgate_servers_down", "Number of monitored servers marked down.", &["cluster"]).unwrap();
    /// 1 if the cluster has a server holding MASTER status, 0 otherwise.
    pub static ref MASTER_PRESENT: GaugeVec =
        register_gauge_vec!("replgate_master_present", "Cluster has a writable master (1 for true, 0 for false).", &["cluster"]).unwrap();
    /// 1 if automatic failover is currently enabled.
    pub static ref AUTO_FAILOVER_ENABLED: GaugeVec =
        register_gauge_vec!("replgate_auto_failover_enabled", "Automatic failover enabled (1 for true, 0 for false).", &["cluster"]).unwrap();


    // --- Counters ---
    /// Completed monitoring passes.
    pub static ref MONITOR_TICKS_TOTAL: CounterVec =
        register_counter_vec!("replgate_monitor_ticks_total", "Total number of committed monitor ticks.", &["cluster"]).unwrap();
    /// Failed server probes, by server.
    pub static ref PROBE_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("replgate_probe_failures_total", "Total number of failed server probes.", &["cluster", "server"]).unwrap();
    /// Failover, switchover and rejoin executions, labeled by outcome class.
    pub static ref OPERATIONS_TOTAL: CounterVec =
        register_counter_vec!("replgate_operations_total", "Total number of cluster operations, labeled by operation and result.", &["cluster", "operation", "result"]).unwrap();
    /// Journal writes that failed.
    pub static ref JOURNAL_WRITE_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("replgate_journal_write_failures_total", "Total number of failed journal writes.", &["cluster"]).unwrap();


    // --- Histograms ---
    /// Wall-clock time of one monitoring pass, probes included.
    pub static ref TICK_DURATION_SECONDS: HistogramVec =
        register_histogram_vec!("replgate_tick_duration_seconds", "Duration of monitor ticks in seconds.", &["cluster"]).unwrap();
}

/// Records the outcome of an engine operation.
pub fn record_operation(cluster: &str, operation: &str, result: &str) {
    OPERATIONS_TOTAL
        .with_label_values(&[cluster, operation, result])
        .inc();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    match encoder.encode_to_string(&metric_families) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            String::new()
        }
    }
}
