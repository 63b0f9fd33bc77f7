use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ports::PortAllocation;
use crate::run::{LaneName, RunId, RunStatus};

/// Lifecycle notification published by the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub lane: LaneName,
    pub timestamp: DateTime<Utc>,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn new(run_id: RunId, lane: LaneName, payload: RunEventPayload) -> Self {
        Self {
            run_id,
            lane,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// What happened to the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RunEventPayload {
    /// Run was accepted and queued on its lane.
    Submitted,
    /// Ports are reserved and the metric subscription is open; the tool is
    /// about to launch.
    MetricsAttached { endpoint: String, ports: PortAllocation },
    /// The tool process is running.
    Started { pid: Option<u32> },
    /// Run reached a terminal status.
    Finished {
        status: RunStatus,
        error: Option<String>,
    },
}

/// In-process fan-out bus for [`RunEvent`]s.
///
/// Publishing never blocks. With no subscribers the event is dropped; a
/// subscriber that falls more than `capacity` events behind receives
/// `RecvError::Lagged` and continues from the oldest retained event.
pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
    capacity: usize,
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl RunEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = RunEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let run_id = RunId::new();
        bus.publish(RunEvent::new(run_id, LaneName::default(), RunEventPayload::Submitted));
        bus.publish(RunEvent::new(
            run_id,
            LaneName::default(),
            RunEventPayload::Finished {
                status: RunStatus::Completed,
                error: None,
            },
        ));

        for rx in [&mut rx1, &mut rx2] {
            let first = timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(first.payload, RunEventPayload::Submitted));
            let second = timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(
                second.payload,
                RunEventPayload::Finished {
                    status: RunStatus::Completed,
                    ..
                }
            ));
            assert_eq!(second.run_id, run_id);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = RunEventBus::new(4);
        bus.publish(RunEvent::new(RunId::new(), "a".into(), RunEventPayload::Submitted));

        let mut late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = RunEventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(RunEvent::new(RunId::new(), "a".into(), RunEventPayload::Submitted));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = RunEvent::new(
            RunId::new(),
            "a".into(),
            RunEventPayload::Started { pid: Some(42) },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "started");
        assert_eq!(json["payload"]["pid"], 42);
    }
}
