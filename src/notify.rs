use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for state transitions, keyed by resource id or group id.
///
/// Per-resource events (holds, confirmations, cancels, expiry) go to the
/// resource's channel; group bookings go to the group's channel.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a resource or group. Creates the channel if needed.
    pub fn subscribe(&self, key: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. Returns how many receivers got it; 0 when nobody
    /// is listening.
    pub fn send(&self, key: Ulid, event: &Event) -> usize {
        let Some(sender) = self.channels.get(&key) else {
            return 0;
        };
        sender.send(event.clone()).unwrap_or(0)
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = Event::ReservationCancelled {
            resource_id: rid,
            holder: "alice".into(),
        };
        assert_eq!(hub.send(rid, &event), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let sent = hub.send(rid, &Event::ResourceAdded { id: rid, group_id: None });
        assert_eq!(sent, 0);
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let kept = hub.subscribe(Ulid::new());
        drop(hub.subscribe(Ulid::new()));
        assert_eq!(hub.channel_count(), 2);

        hub.prune();
        assert_eq!(hub.channel_count(), 1);
        drop(kept);
    }
}
