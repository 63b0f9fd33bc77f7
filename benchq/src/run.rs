use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Unique identifier for a benchmark run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// Create a new run ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a FIFO lane. Runs within one lane execute strictly sequentially.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneName(String);

impl LaneName {
    /// Wrap a lane name. Blank names are rejected at submission.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for LaneName {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl Display for LaneName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for LaneName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LaneName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle status of a run.
///
/// ```text
/// PENDING ──► RUNNING ──► COMPLETED | FAILED | CANCELLED
///    └───────────────────► FAILED | CANCELLED
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the store may move a run from `self` to `next`.
    ///
    /// A pending run may fail or be cancelled before it ever starts, but it
    /// can only complete by way of `Running`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed | RunStatus::Cancelled) => {
                true
            }
            (RunStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(OrchestratorError::InvalidSubmission(format!(
                "invalid status: {other}. Must be one of: pending, running, completed, failed, cancelled"
            ))),
        }
    }
}

fn default_endpoint_type() -> String {
    "chat".to_string()
}

fn default_endpoint() -> String {
    "v1/chat/completions".to_string()
}

fn default_request_count() -> u32 {
    3
}

fn default_concurrency() -> u32 {
    1
}

/// Benchmark parameters handed to the external tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model identifier to benchmark.
    pub model: String,
    /// Base URL of the inference server.
    pub url: String,
    /// Kind of endpoint (chat, completions, ...).
    #[serde(default = "default_endpoint_type")]
    pub endpoint_type: String,
    /// Endpoint path on the server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Tokenizer used to count tokens.
    pub tokenizer: String,
    /// Number of requests to send.
    #[serde(default = "default_request_count")]
    pub request_count: u32,
    /// Number of concurrent requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Target request rate in requests per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_rate: Option<f64>,
    /// Extra arguments appended verbatim after the generated flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl RunConfig {
    /// Create a configuration with the required fields and defaults elsewhere.
    pub fn new(
        model: impl Into<String>,
        url: impl Into<String>,
        tokenizer: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            url: url.into(),
            endpoint_type: default_endpoint_type(),
            endpoint: default_endpoint(),
            tokenizer: tokenizer.into(),
            request_count: default_request_count(),
            concurrency: default_concurrency(),
            request_rate: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_request_count(mut self, count: u32) -> Self {
        self.request_count = count;
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_request_rate(mut self, rate: f64) -> Self {
        self.request_rate = Some(rate);
        self
    }

    pub fn with_endpoint(
        mut self,
        endpoint_type: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        self.endpoint_type = endpoint_type.into();
        self.endpoint = endpoint.into();
        self
    }

    /// Check the configuration once, at submission time.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let required = [
            ("model", &self.model),
            ("url", &self.url),
            ("tokenizer", &self.tokenizer),
            ("endpoint_type", &self.endpoint_type),
            ("endpoint", &self.endpoint),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OrchestratorError::InvalidSubmission(format!(
                    "{field} must not be empty"
                )));
            }
        }
        if self.request_count == 0 {
            return Err(OrchestratorError::InvalidSubmission(
                "request_count must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(OrchestratorError::InvalidSubmission(
                "concurrency must be at least 1".into(),
            ));
        }
        if let Some(rate) = self.request_rate
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(OrchestratorError::InvalidSubmission(format!(
                "request_rate must be positive, got {rate}"
            )));
        }
        Ok(())
    }
}

/// A single benchmark execution as recorded in the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub lane: LaneName,
    pub config: RunConfig,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the run enters RUNNING.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the run reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure detail for FAILED or CANCELLED runs.
    pub error: Option<String>,
}

impl Run {
    /// Create a new pending run with a fresh identifier.
    pub fn pending(lane: LaneName, config: RunConfig) -> Self {
        Self {
            id: RunId::new(),
            lane,
            config,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
