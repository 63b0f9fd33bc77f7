use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::Instrument;

use super::ShutdownToken;
use super::lane::{LaneContext, LaneHandle, LaneSnapshot};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result, StoreError};
use crate::events::{RunEvent, RunEventBus, RunEventPayload};
use crate::metric::{MetricRecord, MetricSummary};
use crate::ports::PortAllocator;
use crate::process::ProcessSupervisor;
use crate::run::{LaneName, Run, RunConfig, RunId, RunStatus};
use crate::store::{RunFilter, RunStore};
use crate::subscriber::MetricSubscriber;
use crate::telemetry;

/// Accepts benchmark runs and drives them through per-lane FIFO workers.
///
/// Each lane gets one worker task, created on the lane's first submission,
/// that executes its runs strictly one after another: allocate ports, attach
/// the metric subscriber, launch the tool, wait for a terminal status, then
/// release everything. Lanes run independently of each other.
///
/// # Example
///
/// ```ignore
/// let controller = RunController::in_memory(OrchestratorConfig::from_env()?)?;
/// let run = controller
///     .submit("gpu-a", RunConfig::new("llama", "http://localhost:8000", "llama"))
///     .await?;
/// // ... later
/// controller.stop().await;
/// ```
pub struct RunController<S>
where
    S: RunStore + 'static,
{
    ctx: Arc<LaneContext<S>>,
    lanes: Mutex<HashMap<LaneName, LaneHandle>>,
}

impl<S> fmt::Debug for RunController<S>
where
    S: RunStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunController")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.ctx.config)
            .field("stopped", &self.ctx.shutdown.is_cancelled())
            .finish()
    }
}

impl<S> RunController<S>
where
    S: RunStore + 'static,
{
    /// Create a controller over `store` with its own event bus.
    ///
    /// The configuration is assumed valid; [`RunControllerBuilder`](super::RunControllerBuilder)
    /// validates before calling this.
    pub fn new(config: OrchestratorConfig, store: Arc<S>) -> Self {
        let events = Arc::new(RunEventBus::new(config.controller.event_capacity));
        Self::with_events(config, store, events)
    }

    pub(crate) fn with_events(
        config: OrchestratorConfig,
        store: Arc<S>,
        events: Arc<RunEventBus>,
    ) -> Self {
        let ctx = LaneContext {
            allocator: PortAllocator::new(config.ports),
            supervisor: ProcessSupervisor::new(Arc::clone(&store), config.supervisor),
            subscriber: MetricSubscriber::new(Arc::clone(&store), config.subscriber),
            events,
            config: config.controller,
            shutdown: ShutdownToken::new(),
            store,
        };
        Self {
            ctx: Arc::new(ctx),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a new run on `lane` and return it in PENDING.
    ///
    /// Does not wait for execution. Every call creates a distinct run.
    pub async fn submit(
        &self,
        lane: impl Into<LaneName>,
        config: RunConfig,
    ) -> Result<Run> {
        let lane = lane.into();
        let span = telemetry::run_submit_span(&lane);
        self.enqueue(lane, config).instrument(span).await
    }

    async fn enqueue(&self, lane: LaneName, config: RunConfig) -> Result<Run> {
        if lane.is_blank() {
            return Err(OrchestratorError::InvalidSubmission(
                "lane name must not be empty".into(),
            ));
        }
        config.validate()?;

        // Held until the run is queued so stop() cannot slip in between the
        // shutdown check and the send.
        let mut lanes = self.lanes.lock().await;
        if self.ctx.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let run = self
            .ctx
            .store
            .create_run(Run::pending(lane.clone(), config))
            .await?;
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        self.ctx.publish(&run, RunEventPayload::Submitted);

        let handle = lanes
            .entry(lane.clone())
            .or_insert_with(|| LaneHandle::spawn(lane.clone(), Arc::clone(&self.ctx)));
        handle.enqueue(run.id)?;
        drop(lanes);

        telemetry::record_run_submitted(run.id, &lane);
        Ok(run)
    }

    /// Cancel a run.
    ///
    /// A pending run is marked CANCELLED and skipped when its lane reaches
    /// it. A running run is stopped through the supervisor. Returns
    /// `Ok(false)` if the run had already finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool> {
        // A pending run can start between our read and our write; go round
        // again with the fresh status when that happens.
        for _ in 0..3 {
            let run = self
                .ctx
                .store
                .get_run(run_id)
                .await?
                .ok_or(OrchestratorError::UnknownRun(run_id))?;

            match run.status {
                RunStatus::Pending => {
                    match self
                        .ctx
                        .store
                        .update_status(
                            run_id,
                            RunStatus::Cancelled,
                            Some("cancelled before start".into()),
                        )
                        .await
                    {
                        Ok(_) => {
                            tracing::info!(run_id = %run_id, "cancelled queued run");
                            return Ok(true);
                        }
                        Err(StoreError::InvalidTransition { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                RunStatus::Running => {
                    tracing::info!(run_id = %run_id, "cancelling running run");
                    return Ok(self.ctx.supervisor.stop(run_id).await);
                }
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    /// Stop accepting work, wind down every lane and release all processes
    /// and subscriptions. Safe to call more than once.
    pub async fn stop(&self) {
        let first = !self.ctx.shutdown.is_cancelled();
        if first {
            tracing::info!("stopping run controller");
        }
        self.ctx.shutdown.cancel();

        let lanes: Vec<(LaneName, LaneHandle)> = {
            let mut lanes = self.lanes.lock().await;
            lanes.drain().collect()
        };
        futures::future::join_all(
            lanes
                .into_iter()
                .map(|(lane, handle)| async move { handle.join(&lane).await }),
        )
        .await;

        self.ctx.supervisor.cleanup().await;
        self.ctx.subscriber.stop_all().await;

        if first {
            tracing::info!("run controller stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    pub async fn run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.ctx.store.get_run(run_id).await?)
    }

    pub async fn runs(&self, filter: RunFilter) -> Result<Vec<Run>> {
        Ok(self.ctx.store.list_runs(filter).await?)
    }

    /// Metrics of a known run, in receipt order.
    pub async fn metrics(&self, run_id: RunId) -> Result<Vec<MetricRecord>> {
        self.require_run(run_id).await?;
        Ok(self.ctx.store.get_metrics(run_id).await?)
    }

    pub async fn metric_summary(&self, run_id: RunId) -> Result<MetricSummary> {
        self.require_run(run_id).await?;
        Ok(self.ctx.store.metric_summary(run_id).await?)
    }

    /// Depth and active run of every lane, sorted by lane name.
    pub async fn lane_snapshot(&self) -> Vec<LaneSnapshot> {
        let lanes = self.lanes.lock().await;
        let mut snapshot: Vec<LaneSnapshot> = lanes
            .iter()
            .map(|(lane, handle)| handle.snapshot(lane))
            .collect();
        snapshot.sort_by(|a, b| a.lane.cmp(&b.lane));
        snapshot
    }

    /// Receive lifecycle events published from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.ctx.events.subscribe()
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.ctx.store)
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.ctx.allocator
    }

    pub fn supervisor(&self) -> &ProcessSupervisor<S> {
        &self.ctx.supervisor
    }

    pub fn subscriber(&self) -> &MetricSubscriber<S> {
        &self.ctx.subscriber
    }

    async fn require_run(&self, run_id: RunId) -> Result<Run> {
        self.ctx
            .store
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::UnknownRun(run_id))
    }
}
