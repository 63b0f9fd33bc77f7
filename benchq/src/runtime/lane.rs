use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ShutdownToken;
use crate::config::ControllerConfig;
use crate::error::{OrchestratorError, StoreError};
use crate::events::{RunEvent, RunEventBus, RunEventPayload};
use crate::ports::PortAllocator;
use crate::process::{ProcessSupervisor, RunCompletion, RunOutcome};
use crate::run::{LaneName, Run, RunId, RunStatus};
use crate::store::RunStore;
use crate::subscriber::MetricSubscriber;
use crate::telemetry;

pub(crate) const STOPPED_BEFORE_START: &str = "orchestrator stopped before run started";

/// Point-in-time view of one lane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSnapshot {
    pub lane: LaneName,
    /// Runs queued behind the active one.
    pub depth: usize,
    pub active_run: Option<RunId>,
    pub sampled_at: DateTime<Utc>,
}

/// Components shared by the controller and every lane worker.
pub(crate) struct LaneContext<S: RunStore + 'static> {
    pub(crate) store: Arc<S>,
    pub(crate) allocator: PortAllocator,
    pub(crate) supervisor: ProcessSupervisor<S>,
    pub(crate) subscriber: MetricSubscriber<S>,
    pub(crate) events: Arc<RunEventBus>,
    pub(crate) config: ControllerConfig,
    pub(crate) shutdown: ShutdownToken,
}

impl<S: RunStore + 'static> LaneContext<S> {
    pub(crate) fn publish(&self, run: &Run, payload: RunEventPayload) {
        self.events
            .publish(RunEvent::new(run.id, run.lane.clone(), payload));
    }

    fn publish_finished(&self, run: &Run) {
        self.publish(
            run,
            RunEventPayload::Finished {
                status: run.status,
                error: run.error.clone(),
            },
        );
    }
}

#[derive(Debug, Default)]
pub(crate) struct LaneState {
    depth: AtomicUsize,
    active: Mutex<Option<RunId>>,
}

/// Controller-side handle to a lane's queue and worker task.
pub(crate) struct LaneHandle {
    tx: mpsc::UnboundedSender<RunId>,
    state: Arc<LaneState>,
    worker: JoinHandle<()>,
}

impl LaneHandle {
    pub(crate) fn spawn<S: RunStore + 'static>(
        lane: LaneName,
        ctx: Arc<LaneContext<S>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(LaneState::default());
        let worker = LaneWorker {
            lane: lane.clone(),
            ctx,
            rx,
            state: Arc::clone(&state),
        };

        tracing::info!(lane = %lane, "starting lane worker");
        let worker = tokio::spawn(worker.run());
        Self { tx, state, worker }
    }

    /// Append a run to the lane. Fails only if the worker has exited.
    pub(crate) fn enqueue(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        self.state.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(run_id).map_err(|_| {
            self.state.depth.fetch_sub(1, Ordering::SeqCst);
            OrchestratorError::ShuttingDown
        })
    }

    pub(crate) fn snapshot(&self, lane: &LaneName) -> LaneSnapshot {
        LaneSnapshot {
            lane: lane.clone(),
            depth: self.state.depth.load(Ordering::SeqCst),
            active_run: *self.state.active.lock(),
            sampled_at: Utc::now(),
        }
    }

    pub(crate) async fn join(self, lane: &LaneName) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            tracing::warn!(lane = %lane, error = %e, "lane worker failed");
        }
    }
}

struct LaneWorker<S: RunStore + 'static> {
    lane: LaneName,
    ctx: Arc<LaneContext<S>>,
    rx: mpsc::UnboundedReceiver<RunId>,
    state: Arc<LaneState>,
}

impl<S: RunStore + 'static> LaneWorker<S> {
    async fn run(mut self) {
        let shutdown = self.ctx.shutdown.clone();
        let dequeue_poll = self.ctx.config.dequeue_poll();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = tokio::time::timeout(dequeue_poll, self.rx.recv()) => next,
            };

            let run_id = match next {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(run_id)) => run_id,
            };
            self.state.depth.fetch_sub(1, Ordering::SeqCst);
            self.execute_next(run_id).await;
        }

        self.drain().await;
        tracing::info!(lane = %self.lane, "lane worker stopped");
    }

    async fn execute_next(&self, run_id: RunId) {
        let run = match self.ctx.store.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!(lane = %self.lane, run_id = %run_id, "queued run vanished from store, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(lane = %self.lane, run_id = %run_id, error = %e, "failed to load queued run, skipping");
                return;
            }
        };

        if run.status != RunStatus::Pending {
            tracing::debug!(run_id = %run_id, status = %run.status, "run no longer pending, skipping");
            if run.is_terminal() {
                self.ctx.publish_finished(&run);
            }
            return;
        }

        if self.ctx.shutdown.is_cancelled() {
            self.cancel_pending(run_id).await;
            return;
        }

        *self.state.active.lock() = Some(run_id);
        telemetry::instrument_execute(run_id, &self.lane, self.execute(run)).await;
        *self.state.active.lock() = None;
    }

    async fn execute(&self, run: Run) {
        let ctx = &self.ctx;
        let timing = telemetry::record_run_started(run.id);

        let allocation = match ctx.allocator.allocate(run.id) {
            Ok(allocation) => allocation,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "port allocation failed");
                self.fail_run(run.id, e.to_string()).await;
                self.finish(run.id, timing).await;
                return;
            }
        };

        let endpoint = allocation.metrics_endpoint();
        ctx.subscriber.subscribe_to_run(run.id, endpoint.clone());
        ctx.publish(
            &run,
            RunEventPayload::MetricsAttached {
                endpoint,
                ports: allocation.clone(),
            },
        );

        let completion = match ctx.supervisor.start(run.id, &run.config, &allocation).await {
            Ok(completion) => completion,
            Err(e) => {
                // Launch failures are already recorded by the supervisor.
                if !matches!(e, OrchestratorError::Launch { .. }) {
                    self.fail_run(run.id, e.to_string()).await;
                }
                self.release(run.id).await;
                self.finish(run.id, timing).await;
                return;
            }
        };
        ctx.publish(
            &run,
            RunEventPayload::Started {
                pid: ctx.supervisor.pid(run.id),
            },
        );

        self.await_terminal(run.id, completion).await;
        self.release(run.id).await;
        self.finish(run.id, timing).await;
    }

    /// Wait until the stored status is terminal.
    ///
    /// The completion signal wakes us as soon as the monitor reports; the
    /// poll interval covers status changes made by anyone else. On shutdown
    /// the run is stopped rather than abandoned in RUNNING.
    async fn await_terminal(&self, run_id: RunId, mut completion: RunCompletion) {
        let shutdown = &self.ctx.shutdown;
        let poll = self.ctx.config.completion_poll();
        let mut stop_requested = false;
        let mut monitor_gone = false;
        let mut reported: Option<RunOutcome> = None;

        loop {
            match self.ctx.store.get_run(run_id).await {
                Ok(Some(run)) if run.is_terminal() => return,
                Ok(Some(_)) if monitor_gone => {
                    self.fail_run(run_id, "process monitor exited without reporting".into())
                        .await;
                    return;
                }
                Ok(Some(_)) => {
                    // The monitor reported but its store write did not land.
                    if let Some(outcome) = &reported {
                        if self.record_outcome(run_id, outcome).await {
                            return;
                        }
                        if stop_requested {
                            tracing::error!(run_id = %run_id, status = %outcome.status, "abandoning run outcome at shutdown");
                            return;
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(run_id = %run_id, "running run vanished from store");
                    return;
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "failed to poll run status");
                    if stop_requested && (reported.is_some() || monitor_gone) {
                        return;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !stop_requested => {
                    stop_requested = true;
                    tracing::info!(run_id = %run_id, "stopping in-flight run for shutdown");
                    self.ctx.supervisor.stop(run_id).await;
                }
                outcome = completion.wait(), if reported.is_none() && !monitor_gone => {
                    match outcome {
                        Some(outcome) => reported = Some(outcome),
                        None => monitor_gone = true,
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Retry writing a reported outcome. True once the run is terminal.
    async fn record_outcome(&self, run_id: RunId, outcome: &RunOutcome) -> bool {
        match self
            .ctx
            .store
            .update_status(run_id, outcome.status, outcome.error.clone())
            .await
        {
            Ok(_) => true,
            Err(StoreError::InvalidTransition { .. }) => true,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "failed to record run outcome, retrying");
                false
            }
        }
    }

    async fn fail_run(&self, run_id: RunId, error: String) {
        match self
            .ctx
            .store
            .update_status(run_id, RunStatus::Failed, Some(error))
            .await
        {
            Ok(_) => {}
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(run_id = %run_id, status = %from, "run already settled, not marking failed");
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to mark run failed");
            }
        }
    }

    async fn cancel_pending(&self, run_id: RunId) {
        match self
            .ctx
            .store
            .update_status(run_id, RunStatus::Cancelled, Some(STOPPED_BEFORE_START.into()))
            .await
        {
            Ok(run) => self.ctx.publish_finished(&run),
            Err(e) => {
                tracing::debug!(run_id = %run_id, error = %e, "queued run not cancelled");
            }
        }
    }

    async fn release(&self, run_id: RunId) {
        self.ctx.subscriber.unsubscribe_from_run(run_id).await;
        self.ctx.allocator.release(run_id);
    }

    async fn finish(&self, run_id: RunId, timing: telemetry::RunTimingHandle) {
        match self.ctx.store.get_run(run_id).await {
            Ok(Some(run)) => {
                telemetry::record_run_finished(timing, &self.lane, run.status);
                self.ctx.publish_finished(&run);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "failed to load finished run");
            }
        }
    }

    /// Cancel everything still queued once the worker is told to stop.
    async fn drain(&mut self) {
        self.rx.close();
        let mut cancelled = 0usize;
        while let Ok(run_id) = self.rx.try_recv() {
            self.state.depth.fetch_sub(1, Ordering::SeqCst);
            self.cancel_pending(run_id).await;
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!(lane = %self.lane, count = cancelled, "cancelled queued runs");
        }
    }
}
