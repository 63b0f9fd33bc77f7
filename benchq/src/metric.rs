use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::run::RunId;

/// Sentinel the tool appends to every topic name so that a subscription to
/// `realtime_metrics$` never matches `realtime_metrics_foo`.
pub const TOPIC_SENTINEL: char = '$';

/// Topics the subscriber listens to on a run's metric endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricTopic {
    RealtimeMetrics,
    RealtimeTelemetryMetrics,
}

impl MetricTopic {
    pub const ALL: [MetricTopic; 2] = [
        MetricTopic::RealtimeMetrics,
        MetricTopic::RealtimeTelemetryMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricTopic::RealtimeMetrics => "realtime_metrics",
            MetricTopic::RealtimeTelemetryMetrics => {
                "realtime_telemetry_metrics"
            }
        }
    }

    /// Exact-match subscription filter, sentinel included.
    pub fn subscription_filter(&self) -> String {
        format!("{}{}", self.as_str(), TOPIC_SENTINEL)
    }
}

impl std::fmt::Display for MetricTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingested metric message. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub run_id: RunId,
    /// Topic name with the sentinel stripped.
    pub topic: String,
    pub data: serde_json::Value,
    /// When the orchestrator received the message, not when it was emitted.
    pub received_at: DateTime<Utc>,
}

impl MetricRecord {
    pub fn new(
        run_id: RunId,
        topic: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            topic: topic.into(),
            data,
            received_at: Utc::now(),
        }
    }
}

/// Reasons a received message is dropped instead of stored.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("expected 2 frames (topic, payload), got {0}")]
    FrameCount(usize),

    #[error("topic is not valid UTF-8")]
    TopicEncoding(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Decode a `[topic, json_payload]` message into a record for `run_id`.
pub fn decode_frames(
    run_id: RunId,
    frames: &[&[u8]],
) -> Result<MetricRecord, DecodeError> {
    let [topic, payload] = frames else {
        return Err(DecodeError::FrameCount(frames.len()));
    };

    let topic = std::str::from_utf8(topic)?;
    let topic = topic.trim_end_matches(TOPIC_SENTINEL);
    let data = serde_json::from_slice(payload)?;

    Ok(MetricRecord::new(run_id, topic, data))
}

/// Aggregate view over the metrics collected for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub run_id: RunId,
    pub total_count: usize,
    /// Distinct topics present, sorted.
    pub topics: Vec<String>,
}

impl MetricSummary {
    pub fn from_records(run_id: RunId, records: &[MetricRecord]) -> Self {
        let topics: BTreeSet<&str> =
            records.iter().map(|record| record.topic.as_str()).collect();
        Self {
            run_id,
            total_count: records.len(),
            topics: topics.into_iter().map(str::to_string).collect(),
        }
    }
}
