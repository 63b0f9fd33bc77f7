use async_trait::async_trait;
use benchq::{
    InMemoryRunStore, LaneName, MetricRecord, Run, RunFilter, RunId, RunStatus, RunStore,
    StoreError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// One successful status change observed by a [`RecordingStore`].
#[derive(Clone, Debug)]
pub struct Transition {
    pub run_id: RunId,
    pub lane: LaneName,
    pub status: RunStatus,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Recording {
    transitions: Vec<Transition>,
    running: HashMap<LaneName, usize>,
    peak_running: HashMap<LaneName, usize>,
}

/// [`InMemoryRunStore`] wrapper that records every status transition and
/// the peak number of simultaneously RUNNING runs per lane.
#[derive(Clone, Debug, Default)]
pub struct RecordingStore {
    inner: InMemoryRunStore,
    recording: Arc<Mutex<Recording>>,
    fail_appends: Arc<AtomicBool>,
    failing_terminal_updates: Arc<AtomicUsize>,
    get_run_calls: Arc<AtomicUsize>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryRunStore {
        &self.inner
    }

    /// Make `append_metric` fail with [`StoreError::Unavailable`].
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `count` transitions into a terminal status with
    /// [`StoreError::Unavailable`].
    pub fn fail_terminal_updates(&self, count: usize) {
        self.failing_terminal_updates.store(count, Ordering::SeqCst);
    }

    /// Number of `get_run` calls served so far.
    pub fn get_run_calls(&self) -> usize {
        self.get_run_calls.load(Ordering::SeqCst)
    }

    fn take_terminal_failure(&self) -> bool {
        self.failing_terminal_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.recording.lock().transitions.clone()
    }

    /// Statuses `run_id` moved through, in order.
    pub fn statuses_of(&self, run_id: RunId) -> Vec<RunStatus> {
        self.recording
            .lock()
            .transitions
            .iter()
            .filter(|t| t.run_id == run_id)
            .map(|t| t.status)
            .collect()
    }

    /// Transitions for one lane, in the order they were applied.
    pub fn lane_history(&self, lane: &str) -> Vec<(RunId, RunStatus)> {
        self.recording
            .lock()
            .transitions
            .iter()
            .filter(|t| t.lane.as_str() == lane)
            .map(|t| (t.run_id, t.status))
            .collect()
    }

    /// Highest number of RUNNING runs observed at once on `lane`.
    pub fn peak_running(&self, lane: &str) -> usize {
        self.recording
            .lock()
            .peak_running
            .get(&LaneName::new(lane))
            .copied()
            .unwrap_or(0)
    }

    fn record(&self, run: &Run) {
        let mut recording = self.recording.lock();
        recording.transitions.push(Transition {
            run_id: run.id,
            lane: run.lane.clone(),
            status: run.status,
            at: Instant::now(),
        });

        if run.status == RunStatus::Running {
            let running = recording.running.entry(run.lane.clone()).or_default();
            *running += 1;
            let current = *running;
            let peak = recording.peak_running.entry(run.lane.clone()).or_default();
            *peak = (*peak).max(current);
        } else if run.status.is_terminal() && run.started_at.is_some() {
            // started_at is only set on entering RUNNING
            if let Some(running) = recording.running.get_mut(&run.lane) {
                *running = running.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl RunStore for RecordingStore {
    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        self.get_run_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_run(run_id).await
    }

    async fn update_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        if status.is_terminal() && self.take_terminal_failure() {
            tracing::debug!(run_id = %run_id, status = %status, "injected store failure");
            return Err(StoreError::Unavailable("terminal update rejected".into()));
        }
        let run = self.inner.update_status(run_id, status, error).await?;
        self.record(&run);
        Ok(run)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        self.inner.list_runs(filter).await
    }

    async fn append_metric(&self, record: MetricRecord) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("append disabled".into()));
        }
        self.inner.append_metric(record).await
    }

    async fn get_metrics(&self, run_id: RunId) -> Result<Vec<MetricRecord>, StoreError> {
        self.inner.get_metrics(run_id).await
    }
}
