use std::fmt;

use crate::config::SupervisorConfig;
use crate::ports::PortAllocation;
use crate::run::RunConfig;

/// Fully resolved invocation of the benchmarking tool for one run.
///
/// Argument order is fixed: configured base arguments, the benchmark
/// flags, any extra arguments from the run, then the UI and metric
/// endpoint flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn build(
        supervisor: &SupervisorConfig,
        run: &RunConfig,
        ports: &PortAllocation,
    ) -> Self {
        let mut args = supervisor.base_args.clone();

        let mut flag = |name: &str, value: String| {
            args.push(name.to_string());
            args.push(value);
        };
        flag("-m", run.model.clone());
        flag("--url", run.url.clone());
        flag("--endpoint-type", run.endpoint_type.clone());
        flag("--custom-endpoint", run.endpoint.clone());
        flag("--tokenizer", run.tokenizer.clone());
        flag("--request-count", run.request_count.to_string());
        flag("--concurrency", run.concurrency.to_string());
        if let Some(rate) = run.request_rate {
            flag("--request-rate", rate.to_string());
        }

        args.extend(run.extra_args.iter().cloned());

        args.push("--ui".to_string());
        args.push(supervisor.ui_mode.clone());
        args.push(supervisor.host_flag.clone());
        args.push(ports.host.clone());
        if let Some(port_flag) = &supervisor.port_flag {
            args.push(port_flag.clone());
            args.push(ports.metrics_port().to_string());
        }

        Self {
            program: supervisor.program.clone(),
            args,
        }
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
