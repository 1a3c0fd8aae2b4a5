//! Controller metrics
//!
//! Recorded into a process-wide registry; exposition is left to the embedding
//! process (`gather_controller_metrics` renders the text format).

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Resource reconciliation duration
    static ref RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "argot_reconciliation_duration_seconds",
            "Resource reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["kind"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Resource reconciliations total
    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "argot_reconciliations_total",
            "Total number of resource reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Work queue depth
    static ref WORKQUEUE_DEPTH: IntGauge = {
        let gauge = IntGauge::new("argot_workqueue_depth", "Current work queue depth")
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Work queue retry/drop outcomes
    static ref WORKQUEUE_REQUEUES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "argot_workqueue_requeues_total",
            "Total number of failed work items, by outcome (retried or dropped)",
        );
        let counter = IntCounterVec::new(opts, &["outcome"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Tunnel links currently started
    static ref TUNNEL_LINKS_ACTIVE: IntGauge = {
        let gauge = IntGauge::new("argot_tunnel_links_active", "Number of started tunnel links")
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Tunnel link repairs
    static ref TUNNEL_LINK_REPAIRS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "argot_tunnel_link_repairs_total",
            "Total number of tunnel daemon relaunches after a failure",
        );
        let counter = IntCounterVec::new(opts, &["host"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record one handled work item
pub fn record_reconciliation(kind: &str, duration_secs: f64, result: &str) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration_secs);

    RECONCILIATIONS_TOTAL
        .with_label_values(&[kind, result])
        .inc();
}

pub fn set_workqueue_depth(depth: usize) {
    WORKQUEUE_DEPTH.set(depth as i64);
}

/// Record a failed work item: `retried` or `dropped`
pub fn record_requeue(outcome: &str) {
    WORKQUEUE_REQUEUES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn link_started() {
    TUNNEL_LINKS_ACTIVE.inc();
}

pub fn link_stopped() {
    TUNNEL_LINKS_ACTIVE.dec();
}

pub fn record_link_repair(host: &str) {
    TUNNEL_LINK_REPAIRS_TOTAL.with_label_values(&[host]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliation_metrics_recorded() {
        record_reconciliation("ingress", 0.012, "success");

        let metrics = gather_controller_metrics().expect("Should gather metrics");
        assert!(
            metrics.contains("argot_reconciliations_total"),
            "Should contain counter metric"
        );
        assert!(
            metrics.contains("argot_reconciliation_duration_seconds"),
            "Should contain histogram metric"
        );
    }

    #[test]
    fn test_link_repair_metrics_recorded() {
        record_link_repair("a.unit.com");

        let metrics = gather_controller_metrics().expect("Should gather metrics");
        assert!(metrics.contains("argot_tunnel_link_repairs_total"));
        assert!(metrics.contains("a.unit.com"));
    }
}
