use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY, one channel per provider or business.
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

    /// Subscribe to a channel. Creates it if needed.
    pub fn subscribe(&self, channel_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&channel_id) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Business;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let bid = Ulid::new();
        let mut rx = hub.subscribe(bid);

        let event = Event::BusinessUpserted(Business::new(bid, "Salon", 0));
        hub.send(bid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let id = Ulid::new();
        hub.send(id, &Event::TransferRejected { id });
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = NotifyHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe(a);
        hub.send(b, &Event::TransferRejected { id: b });
        assert!(rx_a.try_recv().is_err());
    }
}
