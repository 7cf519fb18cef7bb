//! Live connections and per-room presence.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::PersistenceStore;

/// Identity reported for a connection the registry no longer knows.
pub const UNKNOWN_USER: &str = "Unknown";

pub type ConnectionId = Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("outbound queue of connection {0} is full")]
    Full(ConnectionId),
}

/// One accepted socket: who is on it, which room it joined, and the queue
/// its writer task drains.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    username: String,
    room_id: String,
    outbound: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(username: &str, room_id: &str, outbound: mpsc::Sender<Arc<str>>) -> Arc<Connection> {
        Arc::new(Connection {
            id: Uuid::now_v7(),
            username: username.to_owned(),
            room_id: room_id.to_owned(),
            outbound,
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Queues an already serialized frame without waiting.
    pub fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed(self.id));
        }

        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full(self.id),
            TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }

    /// Asks the socket loop to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomPresence {
    pub room_id: String,
    pub user_count: usize,
    pub users: Vec<String>,
}

type Members = HashMap<ConnectionId, Arc<Connection>>;

pub struct ConnectionRegistry {
    store: Arc<dyn PersistenceStore>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    rooms: DashMap<String, Members>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn PersistenceStore>) -> ConnectionRegistry {
        ConnectionRegistry {
            store,
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Registers `conn` globally and in its room, making sure the room has a durable record.
    pub async fn connect(&self, conn: &Arc<Connection>) {
        if let Err(e) = self.store.get_or_create_room(conn.room_id(), conn.username()).await {
            tracing::error!(room_id = conn.room_id(), error = %e, "could not persist room");
        }

        self.connections.insert(conn.id(), Arc::clone(conn));
        self.rooms
            .entry(conn.room_id().to_owned())
            .or_default()
            .insert(conn.id(), Arc::clone(conn));

        tracing::info!(username = conn.username(), room_id = conn.room_id(), "connected");
    }

    /// Forgets `conn_id`, dropping the room once it's empty. Safe to repeat.
    pub fn disconnect(&self, conn_id: ConnectionId, room_id: &str) -> String {
        let username = self
            .connections
            .remove(&conn_id)
            .map(|(_, conn)| conn.username().to_owned())
            .unwrap_or_else(|| UNKNOWN_USER.to_owned());

        if let Some(mut members) = self.rooms.get_mut(room_id) {
            members.remove(&conn_id);
        }
        // Re-checked under the shard lock, so a concurrent join keeps the room alive.
        self.rooms.remove_if(room_id, |_, members| members.is_empty());

        tracing::info!(username = %username, room_id, "disconnected");
        username
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .rooms
            .get(room_id)
            .map(|members| members.values().map(|conn| conn.username().to_owned()).collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Live connections `username` holds in `room_id`, oldest first.
    pub fn connections_of(&self, username: &str, room_id: &str) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self
            .rooms
            .get(room_id)
            .map(|members| {
                members
                    .values()
                    .filter(|conn| conn.username() == username)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        conns.sort_by_key(|conn| conn.id());
        conns
    }

    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn contains(&self, conn_id: ConnectionId) -> bool {
        self.connections.contains_key(&conn_id)
    }

    pub fn active_rooms(&self) -> Vec<RoomPresence> {
        let mut rooms: Vec<RoomPresence> = self
            .rooms
            .iter()
            .map(|entry| {
                let mut users: Vec<String> = entry.values().map(|conn| conn.username().to_owned()).collect();
                users.sort();
                RoomPresence {
                    room_id: entry.key().clone(),
                    user_count: users.len(),
                    users,
                }
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    /// Runs `f` over the room's members while holding the room's entry exclusively.
    ///
    /// `f` must not block; it is how broadcasts get a total order per room.
    pub(crate) fn with_members<R>(&self, room_id: &str, f: impl FnOnce(&Members) -> R) -> Option<R> {
        self.rooms.get_mut(room_id).map(|members| f(&members))
    }

    pub(crate) fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::db::SqliteStore;

    use super::*;

    pub(crate) async fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(SqliteStore::in_memory().await.unwrap()))
    }

    pub(crate) fn conn(username: &str, room_id: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(8);
        (Connection::new(username, room_id, tx), rx)
    }

    #[tokio::test]
    async fn bob_opens_and_closes_lobby() {
        let registry = registry().await;
        let (bob, _rx) = conn("bob", "lobby");

        registry.connect(&bob).await;
        assert_eq!(registry.members("lobby"), vec!["bob"]);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.total_connections(), 1);

        assert_eq!(registry.disconnect(bob.id(), "lobby"), "bob");
        assert!(registry.members("lobby").is_empty());
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.total_connections(), 0);
    }

    #[tokio::test]
    async fn connect_persists_the_room() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let registry = ConnectionRegistry::new(store.clone());
        let (bob, _rx) = conn("bob", "lobby");
        registry.connect(&bob).await;

        let room = store.room("lobby").await.unwrap().unwrap();
        assert_eq!(room.created_by.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn repeated_disconnect_is_harmless() {
        let registry = registry().await;
        let (bob, _rx) = conn("bob", "lobby");
        registry.connect(&bob).await;

        assert_eq!(registry.disconnect(bob.id(), "lobby"), "bob");
        assert_eq!(registry.disconnect(bob.id(), "lobby"), UNKNOWN_USER);
        assert_eq!(registry.disconnect(Uuid::now_v7(), "nowhere"), UNKNOWN_USER);
    }

    #[tokio::test]
    async fn room_survives_until_last_member_leaves() {
        let registry = registry().await;
        let (alice, _a) = conn("alice", "general");
        let (bob, _b) = conn("bob", "general");
        let (carol, _c) = conn("carol", "random");
        registry.connect(&alice).await;
        registry.connect(&bob).await;
        registry.connect(&carol).await;

        assert_eq!(registry.members("general"), vec!["alice", "bob"]);
        registry.disconnect(alice.id(), "general");
        assert_eq!(registry.members("general"), vec!["bob"]);

        let rooms = registry.active_rooms();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].room_id, "general");
        assert_eq!(rooms[1].users, vec!["carol"]);
    }

    #[tokio::test]
    async fn connections_of_one_user_in_one_room() {
        let registry = registry().await;
        let (phone, _p) = conn("alice", "general");
        let (laptop, _l) = conn("alice", "general");
        let (elsewhere, _e) = conn("alice", "random");
        let (bob, _b) = conn("bob", "general");
        for c in [&phone, &laptop, &elsewhere, &bob] {
            registry.connect(c).await;
        }

        let ids: Vec<ConnectionId> = registry.connections_of("alice", "general").iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![phone.id(), laptop.id()]);

        registry.disconnect(phone.id(), "general");
        assert_eq!(registry.connections_of("alice", "general").len(), 1);
        assert!(registry.connections_of("carol", "general").is_empty());
        assert!(registry.connections_of("alice", "lobby").is_empty());
    }

    #[tokio::test]
    async fn unknown_room_has_no_members() {
        let registry = registry().await;
        assert!(registry.members("ghost-town").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_leaves_consistent_state() {
        let registry = Arc::new(registry().await);

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let room = format!("room{}", i % 4);
                    let (c, _rx) = conn(&format!("user{i}"), &room);
                    registry.connect(&c).await;
                    if i % 2 == 0 {
                        registry.disconnect(c.id(), &room);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.total_connections(), 32);
        let in_rooms: usize = registry.active_rooms().iter().map(|r| r.user_count).sum();
        assert_eq!(in_rooms, 32);
    }

    #[test]
    fn delivery_reports_full_and_closed_queues() {
        let (tx, rx) = mpsc::channel(1);
        let c = Connection::new("dave", "general", tx);
        assert!(c.deliver(Arc::from("one")).is_ok());
        assert_eq!(c.deliver(Arc::from("two")), Err(DeliveryError::Full(c.id())));

        drop(rx);
        assert_eq!(c.deliver(Arc::from("three")), Err(DeliveryError::Closed(c.id())));
        assert!(c.is_closed());
    }

    #[test]
    fn closing_stops_delivery() {
        let (c, _rx) = conn("erin", "general");
        c.close();
        assert_eq!(c.deliver(Arc::from("late")), Err(DeliveryError::Closed(c.id())));
    }
}
