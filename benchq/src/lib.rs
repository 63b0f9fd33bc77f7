//! benchq - lane-based orchestration of benchmark runs.
//!
//! Runs of an external benchmarking tool are submitted to named lanes. Each
//! lane executes its runs strictly in submission order, one at a time, while
//! different lanes proceed concurrently. For every run the orchestrator
//! reserves a block of network ports, subscribes to the tool's live metric
//! stream, launches and supervises the tool process, and records the final
//! status.
//!
//! # Core Concepts
//!
//! - **Run**: one execution of the tool, tracked through the [`RunStatus`]
//!   lifecycle `PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED`.
//!
//! - **Store**: the [`RunStore`] trait holds run records and their metrics;
//!   [`InMemoryRunStore`] is the in-process implementation.
//!
//! - **Ports**: [`PortAllocator`] hands out disjoint contiguous port blocks.
//!
//! - **Process supervision**: [`ProcessSupervisor`] launches the tool,
//!   classifies its exit and handles graceful-then-forceful termination.
//!
//! - **Metric ingestion**: [`MetricSubscriber`] consumes the tool's pub/sub
//!   metric topics and appends each message as a [`MetricRecord`].
//!
//! - **Controller**: [`RunController`] owns the lanes and ties the
//!   components together.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use benchq::*;
//!
//! let controller = RunController::in_memory(OrchestratorConfig::from_env()?)?;
//! let run = controller
//!     .submit("gpu-a", RunConfig::new("llama", "http://localhost:8000", "llama"))
//!     .await?;
//! let mut events = controller.subscribe_events();
//! // ... wait for RunEventPayload::Finished for run.id
//! let summary = controller.metric_summary(run.id).await?;
//! controller.stop().await;
//! ```

/// Orchestrator configuration.
///
/// [`OrchestratorConfig`] groups the [`ControllerConfig`], [`PortPoolConfig`],
/// [`SupervisorConfig`] and [`SubscriberConfig`] sections and can be loaded
/// from `BENCHQ_*` environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Run lifecycle events.
///
/// [`RunEvent`]s are broadcast over a [`RunEventBus`]; slow subscribers lag
/// instead of blocking publishers.
pub mod events;

/// Metric topics, records and frame decoding.
pub mod metric;

/// Port pool allocation.
///
/// [`PortAllocator`] reserves one contiguous [`PortAllocation`] per run;
/// [`EndpointRole`] names each port in the block.
pub mod ports;

/// Tool process launch and supervision.
pub mod process;

/// Run records, statuses and configuration.
pub mod run;

/// Run controller and lane workers.
///
/// The `runtime` module provides:
/// - [`RunController`] - submission, cancellation, shutdown and queries
/// - [`RunControllerBuilder`] - explicit dependency wiring
/// - [`LaneSnapshot`] - per-lane depth and active run
/// - [`ShutdownToken`] - cooperative stop signalling
pub mod runtime;

/// Run and metric storage.
pub mod store;

/// Live metric ingestion.
pub mod subscriber;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

pub use config::*;
pub use error::{OrchestratorError, StoreError};
pub use events::*;
pub use metric::*;
pub use ports::*;
pub use process::*;
pub use run::*;
pub use runtime::*;
pub use store::*;
pub use subscriber::*;
