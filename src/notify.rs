use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per server.
///
/// Subscribers use it to push pending-rejection notices to requesters.
/// Slow subscribers lag and miss events rather than blocking commits.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a server's events. Creates the channel if needed.
    pub fn subscribe(&self, server_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(server_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, server_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&server_id) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);

        let event = Event::ServerDeactivated { id: sid };
        hub.send(sid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn channels_are_per_server() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.subscribe(watched);

        hub.send(other, &Event::ServerDeactivated { id: other });
        hub.send(watched, &Event::ServerDeactivated { id: watched });

        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ServerDeactivated { id: watched }
        );
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        // No subscriber, should not panic
        hub.send(sid, &Event::ServerDeactivated { id: sid });
    }
}
