//! Live broadcast hub.
//!
//! Owns a registry of subscriber channels and performs best-effort fan-out of
//! pre-serialized events. Delivery is independent per subscriber: a closed or
//! saturated channel gets its owner evicted without blocking anyone else.
//! There is no replay buffer; late subscribers only see future events.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::reading::Reading;

/// Per-subscriber channel capacity. A subscriber that falls this far behind
/// is treated as failed and evicted.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// An event fanned out to subscribers, tagged by a `type` field on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A newly accepted reading.
    Reading {
        #[serde(flatten)]
        reading: Arc<Reading>,
    },
    /// The device battery level changed.
    Battery { percent: u8 },
}

/// Handle to an open delivery channel. Dropping the handle (or just its
/// receiver) eventually evicts the registration on the next broadcast.
#[derive(Debug)]
pub struct Subscriber {
    pub id: u64,
    /// JSON event payloads, serialized once per broadcast.
    pub rx: mpsc::Receiver<Arc<str>>,
}

/// Registry of live subscribers.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    senders: Mutex<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and hand back its delivery channel.
    pub fn subscribe(&self) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        tracing::debug!(subscriber = id, "subscriber registered");
        Subscriber { id, rx }
    }

    /// Remove a subscriber. Safe to call repeatedly or for unknown ids.
    pub fn unsubscribe(&self, id: u64) {
        let removed = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            tracing::debug!(subscriber = id, "subscriber removed");
        }
    }

    /// Serialize `event` once and attempt delivery to every subscriber.
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, event: &Event) -> usize {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(error) => {
                tracing::error!(%error, "failed to serialize broadcast event");
                return 0;
            }
        };

        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        let mut failed = Vec::new();
        let mut delivered = 0;
        for (&id, tx) in senders.iter() {
            if tx.try_send(Arc::clone(&payload)).is_ok() {
                delivered += 1;
            } else {
                failed.push(id);
            }
        }
        for id in failed {
            senders.remove(&id);
            tracing::debug!(subscriber = id, "evicting unreachable subscriber");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn reading(bpm: u16) -> Arc<Reading> {
        Arc::new(Reading {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            bpm,
            battery_percent: None,
            energy_expended: None,
            rr_intervals_ms: vec![],
        })
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        let delivered = hub.broadcast(&Event::Reading { reading: reading(72) });
        assert_eq!(delivered, 2);

        let payload = a.rx.recv().await.unwrap();
        assert!(payload.contains("\"type\":\"reading\""));
        assert!(payload.contains("\"bpm\":72"));
        assert_eq!(&*b.rx.recv().await.unwrap(), &*payload);
    }

    #[tokio::test]
    async fn failed_subscriber_is_evicted_others_keep_receiving() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe();
        let b = hub.subscribe();
        let mut c = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 3);

        // Closing b's receiver makes its next send fail.
        drop(b.rx);

        let delivered = hub.broadcast(&Event::Battery { percent: 90 });
        assert_eq!(delivered, 2);
        assert_eq!(hub.subscriber_count(), 2);

        let delivered = hub.broadcast(&Event::Battery { percent: 80 });
        assert_eq!(delivered, 2);
        assert!(a.rx.recv().await.unwrap().contains("90"));
        assert!(c.rx.recv().await.unwrap().contains("90"));
    }

    #[tokio::test]
    async fn saturated_subscriber_is_evicted() {
        let hub = BroadcastHub::new();
        let _stuck = hub.subscribe();
        for pct in 0..=SUBSCRIBER_CHANNEL_CAPACITY as u8 {
            hub.broadcast(&Event::Battery { percent: pct });
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = BroadcastHub::new();
        let sub = hub.subscribe();
        hub.unsubscribe(sub.id);
        hub.unsubscribe(sub.id);
        hub.unsubscribe(9999);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let hub = BroadcastHub::new();
        hub.broadcast(&Event::Battery { percent: 50 });

        let mut late = hub.subscribe();
        hub.broadcast(&Event::Battery { percent: 60 });
        let payload = late.rx.recv().await.unwrap();
        assert!(payload.contains("60"));
        assert!(late.rx.try_recv().is_err());
    }

    #[test]
    fn battery_event_wire_shape() {
        let json = serde_json::to_string(&Event::Battery { percent: 85 }).unwrap();
        assert_eq!(json, "{\"type\":\"battery\",\"percent\":85}");
    }
}
