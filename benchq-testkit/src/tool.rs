use benchq::{OrchestratorConfig, SupervisorConfig};

/// A shell script run in place of the benchmarking tool.
///
/// The script is launched as `sh -c <script> aiperf <generated flags>`, so
/// inside it `$0` is `aiperf`, `$1` is `-m` and `$2` the run's model.
#[derive(Clone, Debug)]
pub struct ScriptedTool {
    script: String,
    grace_period_ms: u64,
}

impl ScriptedTool {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            grace_period_ms: 1000,
        }
    }

    /// Exit immediately with `code`.
    pub fn exit(code: i32) -> Self {
        Self::new(format!("exit {code}"))
    }

    /// Sleep for `seconds` (fractional allowed), then exit 0.
    pub fn sleep(seconds: f64) -> Self {
        Self::new(format!("sleep {seconds}"))
    }

    /// Write `message` to stderr and exit with `code`.
    pub fn fail_with(message: &str, code: i32) -> Self {
        let quoted = message.replace('\'', r"'\''");
        Self::new(format!("echo '{quoted}' >&2; exit {code}"))
    }

    /// Loop forever, ignoring SIGTERM.
    pub fn ignore_term() -> Self {
        Self::new("trap '' TERM; while true; do sleep 0.05; done")
    }

    pub fn with_grace_period_ms(mut self, ms: u64) -> Self {
        self.grace_period_ms = ms;
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), self.script.clone(), "aiperf".to_string()],
            grace_period_ms: self.grace_period_ms,
            output_drain_ms: 300,
            ..SupervisorConfig::default()
        }
    }

    /// Fast-polling orchestrator configuration using this tool and the
    /// port pool `[port_start, port_start + 90)`.
    pub fn orchestrator_config(&self, port_start: u16) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.controller.completion_poll_ms = 50;
        config.controller.dequeue_poll_ms = 50;
        config.ports.start = port_start;
        config.ports.end = port_start + 90;
        config.subscriber.recv_timeout_ms = 50;
        config.subscriber.connect_timeout_ms = 200;
        config.subscriber.connect_retry_ms = 20;
        config.subscriber.shutdown_timeout_ms = 1000;
        config.supervisor = self.supervisor_config();
        config
    }
}
