//! Prometheus metrics for benchq.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `benchq_runs_submitted_total` - Runs accepted, by lane
//! - `benchq_runs_finished_total` - Runs reaching a terminal status, by lane and status
//! - `benchq_metric_records_total` - Metric messages stored, by topic
//! - `benchq_metric_messages_dropped_total` - Metric messages received but not stored
//!
//! ## Gauges
//! - `benchq_ports_allocated` - Ports currently reserved by live runs
//!
//! ## Histograms
//! - `benchq_run_duration_seconds` - Wall time from execution start to terminal status
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, Gauge, HistogramVec, IntCounter, Opts, Registry,
    exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for benchq metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `lane`.
pub static RUNS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("benchq_runs_submitted_total", "Total number of runs submitted");
    CounterVec::new(opts, &["lane"])
        .expect("benchq_runs_submitted_total metric creation failed")
});

/// Labels: `lane`, `status` (completed, failed, cancelled).
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "benchq_runs_finished_total",
        "Total number of runs reaching a terminal status",
    );
    CounterVec::new(opts, &["lane", "status"])
        .expect("benchq_runs_finished_total metric creation failed")
});

/// Labels: `topic`.
pub static METRIC_RECORDS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "benchq_metric_records_total",
        "Total number of metric messages stored",
    );
    CounterVec::new(opts, &["topic"])
        .expect("benchq_metric_records_total metric creation failed")
});

pub static METRIC_MESSAGES_DROPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "benchq_metric_messages_dropped_total",
        "Total number of metric messages dropped as malformed",
    )
    .expect("benchq_metric_messages_dropped_total metric creation failed")
});

pub static PORTS_ALLOCATED: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("benchq_ports_allocated", "Ports currently reserved by live runs")
        .expect("benchq_ports_allocated metric creation failed")
});

/// Labels: `lane`, `status`.
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // 0.5s .. ~2.3h
    let buckets = exponential_buckets(0.5, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "benchq_run_duration_seconds",
        "Run execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["lane", "status"])
        .expect("benchq_run_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_FINISHED_TOTAL.clone()),
        Box::new(METRIC_RECORDS_TOTAL.clone()),
        Box::new(METRIC_MESSAGES_DROPPED_TOTAL.clone()),
        Box::new(PORTS_ALLOCATED.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Count a run accepted onto `lane`.
pub fn record_run_submitted(lane: &str) {
    RUNS_SUBMITTED_TOTAL.with_label_values(&[lane]).inc();
}

/// Count a terminal run and observe its wall-clock duration.
pub fn record_run_finished(lane: &str, status: &str, duration_secs: f64) {
    RUNS_FINISHED_TOTAL.with_label_values(&[lane, status]).inc();
    RUN_DURATION_SECONDS
        .with_label_values(&[lane, status])
        .observe(duration_secs);
}

pub fn record_metric_ingested(topic: &str) {
    METRIC_RECORDS_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_metric_dropped() {
    METRIC_MESSAGES_DROPPED_TOTAL.inc();
}

/// Current number of ports handed out to active runs.
pub fn set_ports_allocated(count: f64) {
    PORTS_ALLOCATED.set(count);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
