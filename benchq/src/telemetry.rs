//! Tracing and telemetry instrumentation for benchq.
//!
//! Span constructors for the run lifecycle (submit, execute, launch, ingest)
//! and `record_*` helpers that log an event and, with the `metrics` feature,
//! update the matching Prometheus series. Every helper works with the
//! feature disabled.
//!
//! # Example
//!
//! ```ignore
//! use benchq::telemetry::{run_execute_span, record_run_started};
//!
//! let span = run_execute_span(run_id, &lane);
//! let _enter = span.enter();
//! let timing = record_run_started(run_id);
//! // ... run the tool
//! record_run_finished(timing, &lane, RunStatus::Completed);
//! ```

use std::future::Future;
use tracing::{Instrument, Span, info_span};

use crate::run::{LaneName, RunId, RunStatus};

/// Span covering validation and enqueueing of one submission.
#[must_use]
pub fn run_submit_span(lane: &LaneName) -> Span {
    info_span!("benchq.submit", lane = %lane, run_id = tracing::field::Empty)
}

/// Span covering a lane worker's execution of one run, from port
/// allocation through cleanup.
#[must_use]
pub fn run_execute_span(run_id: RunId, lane: &LaneName) -> Span {
    info_span!("benchq.execute", run_id = %run_id, lane = %lane)
}

/// Span covering the tool launch for a run.
#[must_use]
pub fn run_launch_span(run_id: RunId, program: &str) -> Span {
    info_span!(
        "benchq.launch",
        run_id = %run_id,
        program = %program,
        pid = tracing::field::Empty,
    )
}

/// Span covering a run's metric ingestion loop.
#[must_use]
pub fn metric_ingest_span(run_id: RunId, endpoint: &str) -> Span {
    info_span!("benchq.ingest", run_id = %run_id, endpoint = %endpoint)
}

/// Attach an execute span to a future.
pub fn instrument_execute<F>(
    run_id: RunId,
    lane: &LaneName,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(run_execute_span(run_id, lane))
}

/// Record an accepted submission.
pub fn record_run_submitted(run_id: RunId, lane: &LaneName) {
    tracing::info!(run_id = %run_id, lane = %lane, "run submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_submitted(lane.as_str());
}

/// Record a stored metric message.
pub fn record_metric_ingested(run_id: RunId, topic: &str) {
    tracing::trace!(run_id = %run_id, topic = %topic, "metric stored");

    #[cfg(feature = "metrics")]
    crate::metrics::record_metric_ingested(topic);
}

/// Record a metric message that was received but could not be stored.
pub fn record_metric_dropped(run_id: RunId, reason: &dyn std::fmt::Display) {
    tracing::warn!(run_id = %run_id, reason = %reason, "dropping metric message");

    #[cfg(feature = "metrics")]
    crate::metrics::record_metric_dropped();
}

/// Update the reserved port gauge.
pub fn set_ports_allocated(count: usize) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_ports_allocated(count as f64);

    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

/// Start timing a run. Pass the handle to [`record_run_finished`].
pub fn record_run_started(run_id: RunId) -> RunTimingHandle {
    RunTimingHandle {
        run_id,
        start: std::time::Instant::now(),
    }
}

/// Record a run reaching a terminal status.
pub fn record_run_finished(
    handle: RunTimingHandle,
    lane: &LaneName,
    status: RunStatus,
) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::info!(
        run_id = %handle.run_id,
        lane = %lane,
        status = %status,
        duration_secs = duration_secs,
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(lane.as_str(), status.as_str(), duration_secs);
}

/// Opaque timer returned by [`record_run_started`].
#[derive(Debug)]
pub struct RunTimingHandle {
    run_id: RunId,
    start: std::time::Instant,
}

impl RunTimingHandle {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let lane = LaneName::from("gpu-a");
        let run_id = RunId::new();

        // Spans are disabled without a subscriber, so only check metadata
        // when one exists.
        for (span, name) in [
            (run_submit_span(&lane), "benchq.submit"),
            (run_execute_span(run_id, &lane), "benchq.execute"),
            (run_launch_span(run_id, "aiperf"), "benchq.launch"),
            (metric_ingest_span(run_id, "tcp://127.0.0.1:6001"), "benchq.ingest"),
        ] {
            if let Some(metadata) = span.metadata() {
                assert_eq!(metadata.name(), name);
            }
        }
    }

    #[test]
    fn test_timing_handle() {
        let run_id = RunId::new();
        let handle = record_run_started(run_id);
        assert_eq!(handle.run_id(), run_id);

        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);

        record_run_finished(handle, &LaneName::default(), RunStatus::Completed);
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        let run_id = RunId::new();
        record_run_submitted(run_id, &LaneName::default());
        record_metric_ingested(run_id, "realtime_metrics");
        record_metric_dropped(run_id, &"bad payload");
        set_ports_allocated(9);
    }
}
