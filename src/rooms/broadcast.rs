//! Fan-out of events to room members.

use std::sync::Arc;

use super::{
    msg::ChatEvent,
    registry::{Connection, ConnectionRegistry, DeliveryError},
};

pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> BroadcastRouter {
        BroadcastRouter { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Delivers `event` to everyone in `room_id` right now and returns how many got it.
    ///
    /// A member whose queue is closed or full is evicted after the loop; the
    /// rest still receive the event.
    pub fn broadcast_to_room(&self, event: &ChatEvent, room_id: &str) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let outcome = self.registry.with_members(room_id, |members| {
            let mut delivered = 0;
            let mut failed = Vec::new();
            for conn in members.values() {
                match conn.deliver(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        tracing::warn!(room_id, username = conn.username(), error = %e, "dropping member");
                        failed.push(Arc::clone(conn));
                    }
                }
            }
            (delivered, failed)
        });

        let Some((delivered, failed)) = outcome else {
            return 0;
        };

        for conn in failed {
            self.evict(&conn);
        }

        tracing::debug!(room_id, kind = ?event.kind, delivered, "broadcast");
        delivered
    }

    /// Unicast; the caller decides what a failure means.
    pub fn send_to(&self, conn: &Connection, event: &ChatEvent) -> Result<(), DeliveryError> {
        match encode(event) {
            Some(frame) => conn.deliver(frame),
            None => Ok(()),
        }
    }

    /// Best-effort delivery to every live connection.
    pub fn broadcast_all(&self, event: &ChatEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in self.registry.all_connections() {
            match conn.deliver(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(username = conn.username(), error = %e, "dropping connection");
                    self.evict(&conn);
                }
            }
        }
        delivered
    }

    fn evict(&self, conn: &Connection) {
        conn.close();
        self.registry.disconnect(conn.id(), conn.room_id());
    }
}

fn encode(event: &ChatEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            tracing::error!(kind = ?event.kind, error = %e, "could not serialize event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::rooms::{
        msg::EventKind,
        registry::tests::{conn, registry},
    };

    fn kind_of(frame: &str) -> String {
        let json: serde_json::Value = serde_json::from_str(frame).unwrap();
        json["type"].as_str().unwrap().to_owned()
    }

    async fn router() -> BroadcastRouter {
        BroadcastRouter::new(Arc::new(registry().await))
    }

    #[tokio::test]
    async fn reaches_only_the_room() {
        let router = router().await;
        let (alice, mut rx_a) = conn("alice", "general");
        let (bob, mut rx_b) = conn("bob", "random");
        router.registry().connect(&alice).await;
        router.registry().connect(&bob).await;

        let delivered = router.broadcast_to_room(&ChatEvent::system(EventKind::System, "hi").in_room("general"), "general");
        assert_eq!(delivered, 1);
        assert_eq!(kind_of(&rx_a.try_recv().unwrap()), "system");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_room_is_a_no_op() {
        let router = router().await;
        assert_eq!(router.broadcast_to_room(&ChatEvent::system(EventKind::System, "hi"), "nobody"), 0);
    }

    #[tokio::test]
    async fn one_dead_member_does_not_block_the_rest() {
        let router = router().await;
        let mut receivers = Vec::new();
        for name in ["alice", "bob", "carol", "dave"] {
            let (c, rx) = conn(name, "general");
            router.registry().connect(&c).await;
            receivers.push((c, rx));
        }

        // carol's socket is gone.
        let (carol, carol_rx) = receivers.remove(2);
        drop(carol_rx);

        let delivered = router.broadcast_to_room(&ChatEvent::system(EventKind::System, "hi"), "general");
        assert_eq!(delivered, 3);
        for (_, rx) in receivers.iter_mut() {
            assert!(rx.try_recv().is_ok());
        }

        assert_eq!(router.registry().members("general"), vec!["alice", "bob", "dave"]);
        assert!(!router.registry().contains(carol.id()));
        assert!(carol.is_closed());
    }

    #[tokio::test]
    async fn slow_member_is_evicted() {
        let router = router().await;
        let (tx, _rx) = mpsc::channel(1);
        let slow = Connection::new("slowpoke", "general", tx);
        let (fast, mut fast_rx) = conn("fast", "general");
        router.registry().connect(&slow).await;
        router.registry().connect(&fast).await;

        router.broadcast_to_room(&ChatEvent::system(EventKind::System, "1"), "general");
        router.broadcast_to_room(&ChatEvent::system(EventKind::System, "2"), "general");

        assert_eq!(router.registry().members("general"), vec!["fast"]);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn sequential_broadcasts_keep_their_order() {
        let router = router().await;
        let (alice, mut rx_a) = conn("alice", "general");
        let (bob, mut rx_b) = conn("bob", "general");
        router.registry().connect(&alice).await;
        router.registry().connect(&bob).await;

        for kind in [EventKind::Join, EventKind::Chat, EventKind::Leave] {
            router.broadcast_to_room(&ChatEvent::system(kind, ""), "general");
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let kinds: Vec<String> = (0..3).map(|_| kind_of(&rx.try_recv().unwrap())).collect();
            assert_eq!(kinds, vec!["join", "chat", "leave"]);
        }
    }

    #[tokio::test]
    async fn unicast_failure_is_reported() {
        let router = router().await;
        let (alice, rx) = conn("alice", "general");
        drop(rx);
        let result = router.send_to(&alice, &ChatEvent::system(EventKind::Error, "x"));
        assert_eq!(result, Err(DeliveryError::Closed(alice.id())));
    }

    #[tokio::test]
    async fn broadcast_all_crosses_rooms() {
        let router = router().await;
        let (alice, mut rx_a) = conn("alice", "general");
        let (bob, mut rx_b) = conn("bob", "random");
        let (carol, rx_c) = conn("carol", "random");
        router.registry().connect(&alice).await;
        router.registry().connect(&bob).await;
        router.registry().connect(&carol).await;
        drop(rx_c);

        assert_eq!(router.broadcast_all(&ChatEvent::system(EventKind::System, "maintenance")), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(router.registry().total_connections(), 2);
        assert_eq!(router.registry().members("random"), vec!["bob"]);
    }
}
