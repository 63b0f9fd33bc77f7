use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Instrument;
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::config::SubscriberConfig;
use crate::metric::{MetricTopic, decode_frames};
use crate::run::RunId;
use crate::runtime::ShutdownToken;
use crate::store::RunStore;

struct Subscription {
    endpoint: String,
    stop: ShutdownToken,
    handle: JoinHandle<()>,
}

/// Ingests live metrics published by running tools.
///
/// One ingestion loop per subscribed run. Each loop connects a SUB socket to
/// the run's endpoint, filters on the metric topics and appends every decoded
/// message to the store until its stop token fires.
pub struct MetricSubscriber<S>
where
    S: RunStore + 'static,
{
    store: Arc<S>,
    config: SubscriberConfig,
    subscriptions: Mutex<HashMap<RunId, Subscription>>,
}

impl<S> fmt::Debug for MetricSubscriber<S>
where
    S: RunStore + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSubscriber")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.config)
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

impl<S> MetricSubscriber<S>
where
    S: RunStore + 'static,
{
    pub fn new(store: Arc<S>, config: SubscriberConfig) -> Self {
        Self {
            store,
            config,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start ingesting metrics for `run_id` from `endpoint`.
    ///
    /// Returns `false` without starting anything if the run already has a
    /// subscription.
    pub fn subscribe_to_run(&self, run_id: RunId, endpoint: impl Into<String>) -> bool {
        let endpoint = endpoint.into();
        let mut subscriptions = self.subscriptions.lock();
        if let Some(existing) = subscriptions.get(&run_id) {
            tracing::warn!(
                run_id = %run_id,
                endpoint = %existing.endpoint,
                "run already subscribed"
            );
            return false;
        }

        let stop = ShutdownToken::new();
        let span = crate::telemetry::metric_ingest_span(run_id, &endpoint);
        let ingest = IngestLoop {
            run_id,
            endpoint: endpoint.clone(),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(ingest.run().instrument(span));

        subscriptions.insert(
            run_id,
            Subscription {
                endpoint,
                stop,
                handle,
            },
        );
        true
    }

    /// Stop ingestion for `run_id`, aborting the loop if it does not exit
    /// within the shutdown timeout. Returns `false` if not subscribed.
    pub async fn unsubscribe_from_run(&self, run_id: RunId) -> bool {
        let Some(subscription) = self.subscriptions.lock().remove(&run_id) else {
            return false;
        };

        subscription.stop.cancel();
        let mut handle = subscription.handle;
        match timeout(self.config.shutdown_timeout(), &mut handle).await {
            Ok(Ok(())) => {
                tracing::debug!(run_id = %run_id, "metric subscription closed");
            }
            Ok(Err(e)) => {
                tracing::warn!(run_id = %run_id, error = %e, "ingestion task failed");
            }
            Err(_) => {
                tracing::warn!(
                    run_id = %run_id,
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "ingestion loop did not stop in time, aborting"
                );
                handle.abort();
            }
        }
        true
    }

    pub fn is_subscribed(&self, run_id: RunId) -> bool {
        self.subscriptions.lock().contains_key(&run_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Unsubscribe every run.
    pub async fn stop_all(&self) {
        let run_ids: Vec<RunId> = self.subscriptions.lock().keys().copied().collect();
        if !run_ids.is_empty() {
            tracing::info!(count = run_ids.len(), "closing metric subscriptions");
        }
        join_all(
            run_ids
                .into_iter()
                .map(|run_id| self.unsubscribe_from_run(run_id)),
        )
        .await;
    }
}

struct IngestLoop<S: RunStore + 'static> {
    run_id: RunId,
    endpoint: String,
    store: Arc<S>,
    config: SubscriberConfig,
    stop: ShutdownToken,
}

impl<S: RunStore + 'static> IngestLoop<S> {
    async fn run(self) {
        let Some(mut socket) = self.connect().await else {
            return;
        };

        for topic in MetricTopic::ALL {
            if let Err(e) = socket.subscribe(&topic.subscription_filter()).await {
                tracing::error!(run_id = %self.run_id, topic = %topic, error = %e, "subscribe failed");
                let _ = socket.close().await;
                return;
            }
        }
        tracing::info!(run_id = %self.run_id, endpoint = %self.endpoint, "metric subscription active");

        let mut stored = 0u64;
        let mut dropped = 0u64;
        loop {
            let received = tokio::select! {
                _ = self.stop.cancelled() => break,
                received = timeout(self.config.recv_timeout(), socket.recv()) => received,
            };

            let message = match received {
                // Quiet interval; go round and look at the stop token again.
                Err(_) => continue,
                Ok(Ok(message)) => message,
                Ok(Err(e)) => {
                    tracing::warn!(run_id = %self.run_id, error = %e, "metric socket failed, ending ingestion");
                    break;
                }
            };

            let frames = message.into_vec();
            let frames: Vec<&[u8]> = frames.iter().map(|frame| frame.as_ref()).collect();
            let record = match decode_frames(self.run_id, &frames) {
                Ok(record) => record,
                Err(e) => {
                    dropped += 1;
                    crate::telemetry::record_metric_dropped(self.run_id, &e);
                    continue;
                }
            };

            let topic = record.topic.clone();
            match self.store.append_metric(record).await {
                Ok(()) => {
                    stored += 1;
                    crate::telemetry::record_metric_ingested(self.run_id, &topic);
                }
                Err(e) => {
                    dropped += 1;
                    tracing::error!(run_id = %self.run_id, topic = %topic, error = %e, "failed to store metric");
                }
            }
        }

        let _ = socket.close().await;
        tracing::info!(
            run_id = %self.run_id,
            stored = stored,
            dropped = dropped,
            "metric ingestion stopped"
        );
    }

    /// Connect, retrying until the publisher is reachable or we are stopped.
    async fn connect(&self) -> Option<SubSocket> {
        let mut attempts = 0u32;
        loop {
            if self.stop.is_cancelled() {
                return None;
            }

            let mut socket = SubSocket::new();
            attempts += 1;
            let attempt = tokio::select! {
                _ = self.stop.cancelled() => None,
                result = timeout(self.config.connect_timeout(), socket.connect(&self.endpoint)) => Some(result),
            };
            let Some(attempt) = attempt else {
                let _ = socket.close().await;
                return None;
            };

            match attempt {
                Ok(Ok(())) => {
                    tracing::debug!(run_id = %self.run_id, attempts = attempts, "connected to metric endpoint");
                    return Some(socket);
                }
                Ok(Err(e)) if attempts == 1 => {
                    tracing::debug!(run_id = %self.run_id, error = %e, "metric endpoint not ready, retrying");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::debug!(run_id = %self.run_id, attempts = attempts, "connect attempt timed out");
                }
            }
            let _ = socket.close().await;

            tokio::select! {
                _ = self.stop.cancelled() => return None,
                _ = tokio::time::sleep(self.config.connect_retry()) => {}
            }
        }
    }
}
