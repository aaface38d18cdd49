//! Outbound event channel for status consumers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::detection::DetectionResult;
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    Detection(DetectionEvent),
    Producer(ProducerEvent),
    Session(SessionEvent),
    Stats(Box<StatsSnapshot>),
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    pub producer_id: String,
    pub camera_index: u32,
    pub timestamp: DateTime<Utc>,
    pub frame_sequence: u64,
    pub frame_generation: u64,
    pub detection_count: usize,
    pub results: DetectionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerChange {
    Registered,
    Stale,
    Recovered,
    Evicted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerEvent {
    pub producer_id: String,
    pub change: ProducerChange,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    ProducerEvicted,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub producer_id: String,
    pub camera_index: u32,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<StopReason>,
    pub timestamp: DateTime<Utc>,
}

impl HubEvent {
    pub fn producer(producer_id: &str, change: ProducerChange) -> Self {
        HubEvent::Producer(ProducerEvent {
            producer_id: producer_id.to_string(),
            change,
            timestamp: Utc::now(),
        })
    }

    pub fn session(producer_id: &str, camera_index: u32, state: SessionState, reason: Option<StopReason>) -> Self {
        HubEvent::Session(SessionEvent {
            producer_id: producer_id.to_string(),
            camera_index,
            state,
            reason,
            timestamp: Utc::now(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HubEvent::Detection(_) => "detection",
            HubEvent::Producer(_) => "producer",
            HubEvent::Session(_) => "session",
            HubEvent::Stats(_) => "stats",
        }
    }
}

/// Bounded fan-out of [`HubEvent`]s. Publishing never waits; a subscriber that falls
/// behind by more than the capacity skips the oldest events.
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, published: AtomicU64::new(0) }
    }

    /// Returns the number of subscribers that will see the event.
    pub fn publish(&self, event: HubEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("No subscribers for {} event", kind);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(HubEvent::producer("cam-a", ProducerChange::Registered)), 0);
        assert_eq!(bus.published_total(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(HubEvent::producer("cam-a", ProducerChange::Stale));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_event_json_shape() {
        let event = HubEvent::session("cam-a", 1, SessionState::Stopped, Some(StopReason::ProducerEvicted));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session");
        assert_eq!(json["data"]["state"], "stopped");
        assert_eq!(json["data"]["reason"], "producer_evicted");
        assert_eq!(json["data"]["camera_index"], 1);
    }
}
