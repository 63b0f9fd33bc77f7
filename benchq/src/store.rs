use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;
use crate::metric::{MetricRecord, MetricSummary};
use crate::run::{LaneName, Run, RunId, RunStatus};

/// Optional filters for [`RunStore::list_runs`].
#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub lane: Option<LaneName>,
    pub status: Option<RunStatus>,
}

impl RunFilter {
    /// Match runs on one lane.
    pub fn lane(lane: impl Into<LaneName>) -> Self {
        Self {
            lane: Some(lane.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, run: &Run) -> bool {
        self.lane.as_ref().is_none_or(|lane| &run.lane == lane)
            && self.status.is_none_or(|status| run.status == status)
    }
}

/// Record store for runs and their metrics.
///
/// All operations must be safe to call concurrently from many tasks.
/// Implementations enforce the run status lifecycle: a transition that
/// [`RunStatus::can_transition_to`] rejects fails with
/// [`StoreError::InvalidTransition`] and leaves the record untouched.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run record.
    async fn create_run(&self, run: Run) -> Result<Run, StoreError>;

    /// Fetch a run by ID.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// Move a run to `status`, recording `error` when provided.
    async fn update_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError>;

    /// List runs, most recently created first.
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError>;

    /// Append a metric record to its run.
    async fn append_metric(&self, record: MetricRecord) -> Result<(), StoreError>;

    /// All metrics for a run in receipt order.
    async fn get_metrics(
        &self,
        run_id: RunId,
    ) -> Result<Vec<MetricRecord>, StoreError>;

    /// Count and topic set for a run's metrics.
    async fn metric_summary(
        &self,
        run_id: RunId,
    ) -> Result<MetricSummary, StoreError> {
        let records = self.get_metrics(run_id).await?;
        Ok(MetricSummary::from_records(run_id, &records))
    }
}

#[derive(Debug, Default)]
struct StoreTables {
    runs: HashMap<RunId, Run>,
    metrics: HashMap<RunId, Vec<MetricRecord>>,
}

/// In-process [`RunStore`] backed by hash maps behind one lock.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRunStore {
    inner: Arc<Mutex<StoreTables>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        let mut tables = self.inner.lock();
        tables.metrics.entry(run.id).or_default();
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.inner.lock().runs.get(&run_id).cloned())
    }

    async fn update_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        let mut tables = self.inner.lock();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::NotFound(run_id))?;

        if !run.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: run.status,
                to: status,
            });
        }

        let now = Utc::now();
        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.completed_at = Some(now);
        }
        if let Some(error) = error {
            run.error = Some(error);
        }

        Ok(run.clone())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let tables = self.inner.lock();
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        // v7 ids break ties between runs created within the same tick.
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });
        Ok(runs)
    }

    async fn append_metric(&self, record: MetricRecord) -> Result<(), StoreError> {
        let mut tables = self.inner.lock();
        tables.metrics.entry(record.run_id).or_default().push(record);
        Ok(())
    }

    async fn get_metrics(
        &self,
        run_id: RunId,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .metrics
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunConfig;

    fn pending(lane: &str) -> Run {
        Run::pending(lane.into(), RunConfig::new("m", "http://x", "tok"))
    }

    #[tokio::test]
    async fn test_update_status_sets_timestamps() {
        let store = InMemoryRunStore::new();
        let run = store.create_run(pending("a")).await.unwrap();
        assert!(run.started_at.is_none());

        let running = store
            .update_status(run.id, RunStatus::Running, None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = store
            .update_status(run.id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.started_at, running.started_at);
        assert!(done.completed_at.is_some());
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = InMemoryRunStore::new();
        let run = store.create_run(pending("a")).await.unwrap();
        store
            .update_status(run.id, RunStatus::Failed, Some("boom".into()))
            .await
            .unwrap();

        let err = store
            .update_status(run.id, RunStatus::Running, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                run_id: run.id,
                from: RunStatus::Failed,
                to: RunStatus::Running,
            }
        );

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_update_unknown_run_is_not_found() {
        let store = InMemoryRunStore::new();
        let id = RunId::new();
        assert_eq!(
            store
                .update_status(id, RunStatus::Running, None)
                .await
                .unwrap_err(),
            StoreError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_orders_newest_first() {
        let store = InMemoryRunStore::new();
        let first = store.create_run(pending("a")).await.unwrap();
        let second = store.create_run(pending("b")).await.unwrap();
        let third = store.create_run(pending("a")).await.unwrap();
        store
            .update_status(third.id, RunStatus::Running, None)
            .await
            .unwrap();

        let all = store.list_runs(RunFilter::default()).await.unwrap();
        let ids: Vec<RunId> = all.iter().map(|run| run.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let lane_a = store.list_runs(RunFilter::lane("a")).await.unwrap();
        assert_eq!(lane_a.len(), 2);

        let running = store
            .list_runs(RunFilter::lane("a").with_status(RunStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, third.id);
    }

    #[tokio::test]
    async fn test_metrics_keep_receipt_order() {
        let store = InMemoryRunStore::new();
        let run = store.create_run(pending("a")).await.unwrap();
        for i in 0..5 {
            store
                .append_metric(MetricRecord::new(run.id, "realtime_metrics", i.into()))
                .await
                .unwrap();
        }

        let metrics = store.get_metrics(run.id).await.unwrap();
        let values: Vec<i64> = metrics
            .iter()
            .map(|record| record.data.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);

        let summary = store.metric_summary(run.id).await.unwrap();
        assert_eq!(summary.total_count, 5);
        assert_eq!(summary.topics, vec!["realtime_metrics"]);

        assert!(store.get_metrics(RunId::new()).await.unwrap().is_empty());
    }
}
