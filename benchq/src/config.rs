use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::OrchestratorError;

/// Lane worker and controller timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How often a worker re-checks the stored status of its active run.
    pub completion_poll_ms: u64,
    /// How long a worker blocks on an empty lane before checking for shutdown.
    pub dequeue_poll_ms: u64,
    /// Buffer size of the run lifecycle event bus.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            completion_poll_ms: 1000,
            dequeue_poll_ms: 1000,
            event_capacity: 256,
        }
    }
}

impl ControllerConfig {
    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms)
    }

    pub fn dequeue_poll(&self) -> Duration {
        Duration::from_millis(self.dequeue_poll_ms)
    }
}

/// Pool of network ports handed out in contiguous per-run blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPoolConfig {
    /// Host the tool binds its sockets on.
    pub host: String,
    /// First port of the pool (inclusive).
    pub start: u16,
    /// End of the pool (exclusive).
    pub end: u16,
    /// Ports reserved per run.
    pub ports_per_run: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            start: 6000,
            end: 6999,
            ports_per_run: 9,
        }
    }
}

impl PortPoolConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.host.trim().is_empty() {
            return Err(OrchestratorError::Config("ports.host is empty".into()));
        }
        if self.start >= self.end {
            return Err(OrchestratorError::Config(format!(
                "ports.start ({}) must be below ports.end ({})",
                self.start, self.end
            )));
        }
        if self.ports_per_run < 2 {
            return Err(OrchestratorError::Config(
                "ports.ports_per_run must cover at least the event bus pair (2)"
                    .into(),
            ));
        }
        if self.ports_per_run > self.end - self.start {
            return Err(OrchestratorError::Config(format!(
                "ports.ports_per_run ({}) exceeds the pool size ({})",
                self.ports_per_run,
                self.end - self.start
            )));
        }
        Ok(())
    }
}

/// How the external benchmarking tool is launched and torn down.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable to launch.
    pub program: String,
    /// Arguments placed before the generated flags.
    pub base_args: Vec<String>,
    /// Value of the `--ui` flag.
    pub ui_mode: String,
    /// Flag carrying the metric-publish host.
    pub host_flag: String,
    /// Flag carrying the metric-publish port, when the tool accepts one.
    pub port_flag: Option<String>,
    /// Wait after the graceful signal before killing the process.
    pub grace_period_ms: u64,
    /// Maximum characters of stderr kept as a failed run's error text.
    pub error_excerpt_chars: usize,
    /// Wait for the output readers after the process has exited.
    pub output_drain_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: "aiperf".to_string(),
            base_args: vec!["profile".to_string()],
            ui_mode: "dashboard".to_string(),
            host_flag: "--zmq-host".to_string(),
            port_flag: None,
            grace_period_ms: 10_000,
            error_excerpt_chars: 1000,
            output_drain_ms: 2000,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.program.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "supervisor.program is empty".into(),
            ));
        }
        if self.error_excerpt_chars == 0 {
            return Err(OrchestratorError::Config(
                "supervisor.error_excerpt_chars must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Metric socket behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Receive timeout; bounds how long a stop request can go unnoticed.
    pub recv_timeout_ms: u64,
    /// Wait for an ingestion loop to exit before cancelling it.
    pub shutdown_timeout_ms: u64,
    /// Timeout of a single connect attempt.
    pub connect_timeout_ms: u64,
    /// Pause between connect attempts while the tool has not bound yet.
    pub connect_retry_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 1000,
            shutdown_timeout_ms: 5000,
            connect_timeout_ms: 1000,
            connect_retry_ms: 200,
        }
    }
}

impl SubscriberConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}

/// Top-level configuration for a [`RunController`](crate::runtime::RunController).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub controller: ControllerConfig,
    pub ports: PortPoolConfig,
    pub supervisor: SupervisorConfig,
    pub subscriber: SubscriberConfig,
}

impl OrchestratorConfig {
    /// Defaults overlaid with `BENCHQ_*` environment variables.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values returned by `lookup`.
    ///
    /// Unset keys keep their defaults; a set key that fails to parse is an
    /// error rather than being silently ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OrchestratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("BENCHQ_COMPLETION_POLL_MS") {
            config.controller.completion_poll_ms = parse(&value, "BENCHQ_COMPLETION_POLL_MS")?;
        }
        if let Some(value) = lookup("BENCHQ_DEQUEUE_POLL_MS") {
            config.controller.dequeue_poll_ms = parse(&value, "BENCHQ_DEQUEUE_POLL_MS")?;
        }
        if let Some(value) = lookup("BENCHQ_PORT_HOST") {
            config.ports.host = value;
        }
        if let Some(value) = lookup("BENCHQ_PORT_START") {
            config.ports.start = parse(&value, "BENCHQ_PORT_START")?;
        }
        if let Some(value) = lookup("BENCHQ_PORT_END") {
            config.ports.end = parse(&value, "BENCHQ_PORT_END")?;
        }
        if let Some(value) = lookup("BENCHQ_PORTS_PER_RUN") {
            config.ports.ports_per_run = parse(&value, "BENCHQ_PORTS_PER_RUN")?;
        }
        if let Some(value) = lookup("BENCHQ_TOOL_PROGRAM") {
            config.supervisor.program = value;
        }
        if let Some(value) = lookup("BENCHQ_TOOL_ARGS") {
            config.supervisor.base_args =
                value.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = lookup("BENCHQ_TOOL_PORT_FLAG") {
            config.supervisor.port_flag = Some(value).filter(|flag| !flag.is_empty());
        }
        if let Some(value) = lookup("BENCHQ_GRACE_PERIOD_MS") {
            config.supervisor.grace_period_ms = parse(&value, "BENCHQ_GRACE_PERIOD_MS")?;
        }
        if let Some(value) = lookup("BENCHQ_RECV_TIMEOUT_MS") {
            config.subscriber.recv_timeout_ms = parse(&value, "BENCHQ_RECV_TIMEOUT_MS")?;
        }
        if let Some(value) = lookup("BENCHQ_UNSUBSCRIBE_TIMEOUT_MS") {
            config.subscriber.shutdown_timeout_ms =
                parse(&value, "BENCHQ_UNSUBSCRIBE_TIMEOUT_MS")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        self.ports.validate()?;
        self.supervisor.validate()?;
        if self.controller.completion_poll_ms == 0
            || self.controller.dequeue_poll_ms == 0
            || self.subscriber.recv_timeout_ms == 0
        {
            return Err(OrchestratorError::Config(
                "poll intervals and receive timeout must be positive".into(),
            ));
        }
        if self.controller.event_capacity == 0 {
            return Err(OrchestratorError::Config(
                "controller.event_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T>(value: &str, key: &str) -> Result<T, OrchestratorError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| OrchestratorError::Config(format!("{key}={value}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.supervisor.grace_period_ms, 10_000);
        assert_eq!(config.subscriber.shutdown_timeout_ms, 5000);
        assert_eq!(config.controller.completion_poll_ms, 1000);
        assert_eq!(config.ports.ports_per_run, 9);
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("BENCHQ_PORT_START", "7000"),
            ("BENCHQ_PORT_END", "7100"),
            ("BENCHQ_TOOL_PROGRAM", "/opt/bin/aiperf"),
            ("BENCHQ_TOOL_ARGS", "profile --verbose"),
            ("BENCHQ_TOOL_PORT_FLAG", "--zmq-port"),
        ]))
        .unwrap();

        assert_eq!(config.ports.start, 7000);
        assert_eq!(config.ports.end, 7100);
        assert_eq!(config.supervisor.program, "/opt/bin/aiperf");
        assert_eq!(config.supervisor.base_args, vec!["profile", "--verbose"]);
        assert_eq!(config.supervisor.port_flag.as_deref(), Some("--zmq-port"));
    }

    #[test]
    fn test_unparseable_value_is_an_error() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "BENCHQ_PORT_START",
            "sixty",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("BENCHQ_PORT_START"));
    }

    #[test]
    fn test_port_pool_validation() {
        let inverted = PortPoolConfig {
            start: 7000,
            end: 6000,
            ..PortPoolConfig::default()
        };
        assert!(inverted.validate().is_err());

        let too_small = PortPoolConfig {
            start: 7000,
            end: 7004,
            ports_per_run: 9,
            ..PortPoolConfig::default()
        };
        assert!(too_small.validate().is_err());

        let single = PortPoolConfig {
            ports_per_run: 1,
            ..PortPoolConfig::default()
        };
        assert!(single.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "ports": { "start": 9000, "end": 9090 },
            "supervisor": { "grace_period_ms": 250 }
        }))
        .unwrap();

        assert_eq!(config.ports.start, 9000);
        assert_eq!(config.ports.ports_per_run, 9);
        assert_eq!(config.supervisor.grace_period_ms, 250);
        assert_eq!(config.supervisor.program, "aiperf");
    }
}
