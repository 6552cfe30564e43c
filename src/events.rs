// Event bus for monitor state changes
//
// Publication is fire-and-forget: every subscriber owns a bounded queue, a
// full queue drops the event for that subscriber only, and a dropped receiver
// is pruned on the next publish. The worker never blocks on a slow consumer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detection::Detection;
use crate::session::AlertLogEntry;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// State-change notifications published by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// Published for every processed frame
    DetectionUpdate {
        detected: bool,
        /// Seconds since the current session started, 0 without a session
        duration: f64,
        detections: Vec<Detection>,
        count: usize,
        session_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
    AlertFired {
        #[serde(flatten)]
        entry: AlertLogEntry,
        recording_active: bool,
    },
    RecordingStarted {
        filename: String,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    RecordingStopped {
        filename: String,
        session_id: Uuid,
        file_size: u64,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorEvent::DetectionUpdate { .. } => "detection_update",
            MonitorEvent::AlertFired { .. } => "alert_fired",
            MonitorEvent::RecordingStarted { .. } => "recording_started",
            MonitorEvent::RecordingStopped { .. } => "recording_stopped",
        }
    }
}

/// Lossy one-to-many fan-out over bounded crossbeam channels
pub struct Broadcast<T> {
    subscribers: Arc<Mutex<Vec<Sender<T>>>>,
    capacity: usize,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking.
    /// Returns the number of subscribers that received the value.
    pub fn publish(&self, value: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(value.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Publishes [`MonitorEvent`]s to any number of subscribers
pub type EventBus = Broadcast<MonitorEvent>;

impl EventBus {
    /// Publish and log the event kind at debug level
    pub fn emit(&self, event: MonitorEvent) {
        let kind = event.kind();
        let delivered = self.publish(event);
        log::debug!("Published {} to {} subscriber(s)", kind, delivered);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped(file_size: u64) -> MonitorEvent {
        MonitorEvent::RecordingStopped {
            filename: "incident.avi".into(),
            session_id: Uuid::nil(),
            file_size,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn full_subscriber_does_not_block_others() {
        let bus = Broadcast::<u32>::new(1);
        let slow = bus.subscribe();
        let fast = bus.subscribe();

        assert_eq!(bus.publish(1), 2);
        assert_eq!(fast.try_recv().unwrap(), 1);
        // `slow` is full now; only `fast` receives
        assert_eq!(bus.publish(2), 1);
        assert_eq!(fast.try_recv().unwrap(), 2);
        assert_eq!(slow.try_recv().unwrap(), 1);
        assert!(slow.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = Broadcast::<u32>::new(4);
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(7);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv().unwrap(), 7);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::default();
        bus.emit(stopped(10));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(stopped(42)).unwrap();
        assert_eq!(json["event"], "recording_stopped");
        assert_eq!(json["file_size"], 42);
        assert_eq!(stopped(0).kind(), "recording_stopped");
    }
}
