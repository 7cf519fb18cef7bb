//! Per-(user, room) violation tracking and the mute lifecycle.
//!
//! Every record lives in a [`DashMap`] entry and is only ever touched through
//! that entry's write guard, so `record`, `check_status` and `manual_unmute`
//! on the same key are mutually exclusive. Nothing here awaits while a guard
//! is held; writes to the store happen after the guard is dropped and carry a
//! revision so a late write never overwrites a newer one.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::db::PersistenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutePolicy {
    /// Consecutive toxic messages that trigger a mute.
    pub threshold: u32,
    pub duration: Duration,
}

impl Default for MutePolicy {
    fn default() -> Self {
        MutePolicy {
            threshold: 5,
            duration: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbuseKey {
    pub username: String,
    pub room_id: String,
}

impl AbuseKey {
    pub fn new(username: &str, room_id: &str) -> AbuseKey {
        AbuseKey {
            username: username.to_owned(),
            room_id: room_id.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbuseRecord {
    pub consecutive_toxic_count: u32,
    /// Bumped on every toxic message, muted or not. Never reset.
    pub warning_count: u32,
    pub is_muted: bool,
    pub muted_at: Option<OffsetDateTime>,
    pub mute_expires_at: Option<OffsetDateTime>,
    pub total_mute_count: u32,
    /// Bumped on every change; the store keeps the highest revision it has seen.
    pub revision: i64,
}

impl AbuseRecord {
    fn clear_mute(&mut self) {
        self.is_muted = false;
        self.muted_at = None;
        self.mute_expires_at = None;
        self.consecutive_toxic_count = 0;
    }

    fn remaining_seconds(&self, now: OffsetDateTime) -> Option<i64> {
        match (self.is_muted, self.mute_expires_at) {
            (true, Some(expires_at)) => Some((expires_at - now).whole_seconds().max(0)),
            _ => None,
        }
    }

    fn snapshot(&self, now: OffsetDateTime, just_unmuted: bool) -> MuteStatus {
        MuteStatus {
            is_muted: self.is_muted,
            muted_at: self.muted_at,
            mute_expires_at: self.mute_expires_at,
            remaining_seconds: self.remaining_seconds(now),
            warning_count: self.warning_count,
            consecutive_toxic_count: self.consecutive_toxic_count,
            total_mute_count: self.total_mute_count,
            just_unmuted,
        }
    }
}

/// Point-in-time view of one user's standing in one room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MuteStatus {
    pub is_muted: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub muted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub mute_expires_at: Option<OffsetDateTime>,
    pub remaining_seconds: Option<i64>,
    pub warning_count: u32,
    pub consecutive_toxic_count: u32,
    pub total_mute_count: u32,
    pub just_unmuted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseAction {
    None,
    Warning,
    Muted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub action: AbuseAction,
    pub status: MuteStatus,
    pub warnings_until_mute: u32,
    pub toxic_threshold: u32,
    pub mute_duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutedUser {
    pub username: String,
    #[serde(flatten)]
    pub status: MuteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub room_id: String,
    pub warning_count: u32,
    pub consecutive_toxic_count: u32,
    pub total_mute_count: u32,
    pub is_muted: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub mute_expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub username: String,
    pub total_warnings: u32,
    pub total_mutes: u32,
    pub rooms: Vec<RoomStats>,
}

/// Abuse records for every (user, room) pair seen since startup, loaded
/// lazily from and written through to the store when one is attached.
#[derive(Default)]
pub struct AbuseTracker {
    policy: MutePolicy,
    records: DashMap<AbuseKey, AbuseRecord>,
    store: Option<Arc<dyn PersistenceStore>>,
}

impl AbuseTracker {
    /// Memory-only tracker.
    pub fn new(policy: MutePolicy) -> AbuseTracker {
        AbuseTracker {
            policy,
            records: DashMap::new(),
            store: None,
        }
    }

    pub fn with_store(policy: MutePolicy, store: Arc<dyn PersistenceStore>) -> AbuseTracker {
        AbuseTracker {
            store: Some(store),
            ..AbuseTracker::new(policy)
        }
    }

    /// Feeds one classified message into the user's record.
    pub async fn record(&self, username: &str, room_id: &str, is_toxic: bool, now: OffsetDateTime) -> RecordOutcome {
        let key = AbuseKey::new(username, room_id);
        self.load(&key).await;

        if !is_toxic {
            // Cumulative policy: clean messages never touch the counter.
            let status = self
                .records
                .get(&key)
                .map(|record| record.snapshot(now, false))
                .unwrap_or_default();
            return self.outcome(AbuseAction::None, status);
        }

        let mut record = self.records.entry(key.clone()).or_default();
        record.consecutive_toxic_count += 1;
        record.warning_count += 1;
        record.revision += 1;

        let action = if record.consecutive_toxic_count >= self.policy.threshold {
            record.is_muted = true;
            record.muted_at = Some(now);
            record.mute_expires_at = Some(now + self.policy.duration);
            record.total_mute_count += 1;
            record.consecutive_toxic_count = 0;

            tracing::info!(
                username, room_id,
                mute_count = record.total_mute_count,
                "muted until {:?}", record.mute_expires_at,
            );
            AbuseAction::Muted
        } else {
            tracing::info!(
                username, room_id,
                consecutive = record.consecutive_toxic_count,
                warnings = record.warning_count,
                "toxic message",
            );
            AbuseAction::Warning
        };

        let status = record.snapshot(now, false);
        let saved = record.clone();
        drop(record);

        self.save(&key, &saved).await;
        self.outcome(action, status)
    }

    /// Current standing, lifting an expired mute on the way.
    ///
    /// `just_unmuted` is reported exactly once per expiry.
    pub async fn check_status(&self, username: &str, room_id: &str, now: OffsetDateTime) -> MuteStatus {
        let key = AbuseKey::new(username, room_id);
        self.load(&key).await;

        let mut record = self.records.entry(key.clone()).or_default();

        let expired = record.is_muted && record.mute_expires_at.is_some_and(|expires_at| now >= expires_at);
        if !expired {
            return record.snapshot(now, false);
        }

        record.clear_mute();
        record.revision += 1;
        tracing::info!(username, room_id, "mute expired");

        let status = record.snapshot(now, true);
        let saved = record.clone();
        drop(record);

        self.save(&key, &saved).await;
        status
    }

    /// Lifts a mute before it expires. Returns `false` if the user wasn't muted.
    pub async fn manual_unmute(&self, username: &str, room_id: &str) -> bool {
        let key = AbuseKey::new(username, room_id);
        self.load(&key).await;

        let Some(mut record) = self.records.get_mut(&key) else {
            return false;
        };

        if !record.is_muted {
            return false;
        }

        record.clear_mute();
        record.revision += 1;
        tracing::info!(username, room_id, "manually unmuted");

        let saved = record.clone();
        drop(record);

        self.save(&key, &saved).await;
        true
    }

    /// Users whose mute in `room_id` is still running at `now`.
    pub async fn muted_users(&self, room_id: &str, now: OffsetDateTime) -> Vec<MutedUser> {
        if let Some(store) = &self.store {
            match store.abuse_in_room(room_id).await {
                Ok(rows) => self.hydrate(rows),
                Err(e) => tracing::error!(room_id, error = %e, "could not load mute records"),
            }
        }

        let mut muted: Vec<MutedUser> = self
            .records
            .iter()
            .filter(|entry| entry.key().room_id == room_id)
            .filter(|entry| entry.is_muted && entry.mute_expires_at.is_some_and(|expires_at| expires_at > now))
            .map(|entry| MutedUser {
                username: entry.key().username.clone(),
                status: entry.snapshot(now, false),
            })
            .collect();

        muted.sort_by(|a, b| a.username.cmp(&b.username));
        muted
    }

    /// Counters for one user, in a single room or across every room they have a record in.
    pub async fn user_stats(&self, username: &str, room_id: Option<&str>) -> UserStats {
        if let Some(store) = &self.store {
            match store.abuse_of_user(username).await {
                Ok(rows) => self.hydrate(rows),
                Err(e) => tracing::error!(username, error = %e, "could not load mute records"),
            }
        }

        let mut rooms: Vec<RoomStats> = self
            .records
            .iter()
            .filter(|entry| entry.key().username == username)
            .filter(|entry| room_id.is_none_or(|room_id| entry.key().room_id == room_id))
            .map(|entry| RoomStats {
                room_id: entry.key().room_id.clone(),
                warning_count: entry.warning_count,
                consecutive_toxic_count: entry.consecutive_toxic_count,
                total_mute_count: entry.total_mute_count,
                is_muted: entry.is_muted,
                mute_expires_at: entry.mute_expires_at,
            })
            .collect();

        if rooms.is_empty() {
            if let Some(room_id) = room_id {
                rooms.push(RoomStats {
                    room_id: room_id.to_owned(),
                    warning_count: 0,
                    consecutive_toxic_count: 0,
                    total_mute_count: 0,
                    is_muted: false,
                    mute_expires_at: None,
                });
            }
        }
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        UserStats {
            username: username.to_owned(),
            total_warnings: rooms.iter().map(|r| r.warning_count).sum(),
            total_mutes: rooms.iter().map(|r| r.total_mute_count).sum(),
            rooms,
        }
    }

    /// Pulls `key` from the store unless it's already in memory.
    ///
    /// Memory wins any race: a record inserted while the query ran is kept.
    async fn load(&self, key: &AbuseKey) {
        let Some(store) = &self.store else {
            return;
        };
        if self.records.contains_key(key) {
            return;
        }

        match store.load_abuse(&key.username, &key.room_id).await {
            Ok(Some(record)) => {
                self.records.entry(key.clone()).or_insert(record);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(username = %key.username, room_id = %key.room_id, error = %e, "could not load mute record");
            }
        }
    }

    fn hydrate(&self, rows: Vec<(AbuseKey, AbuseRecord)>) {
        for (key, record) in rows {
            self.records.entry(key).or_insert(record);
        }
    }

    async fn save(&self, key: &AbuseKey, record: &AbuseRecord) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_abuse(key, record).await {
            tracing::error!(username = %key.username, room_id = %key.room_id, error = %e, "could not save mute record");
        }
    }

    fn outcome(&self, action: AbuseAction, status: MuteStatus) -> RecordOutcome {
        RecordOutcome {
            action,
            warnings_until_mute: self.policy.threshold.saturating_sub(status.consecutive_toxic_count),
            toxic_threshold: self.policy.threshold,
            mute_duration_minutes: self.policy.duration.whole_minutes(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::db::SqliteStore;

    const T0: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

    fn tracker() -> AbuseTracker {
        AbuseTracker::new(MutePolicy::default())
    }

    async fn mute(tracker: &AbuseTracker, username: &str, room_id: &str, now: OffsetDateTime) {
        for _ in 0..5 {
            tracker.record(username, room_id, true, now).await;
        }
    }

    #[tokio::test]
    async fn five_toxic_messages_mute_alice() {
        let tracker = tracker();
        let mut actions = Vec::new();
        for _ in 0..5 {
            actions.push(tracker.record("alice", "general", true, T0).await.action);
        }

        let warning = AbuseAction::Warning;
        assert_eq!(actions, vec![warning, warning, warning, warning, AbuseAction::Muted]);

        let status = tracker.check_status("alice", "general", T0).await;
        assert!(status.is_muted);
        assert_eq!(status.total_mute_count, 1);
        assert_eq!(status.consecutive_toxic_count, 0);
        assert_eq!(status.warning_count, 5);
        assert_eq!(status.muted_at, Some(T0));
        assert_eq!(status.mute_expires_at, Some(T0 + Duration::seconds(300)));
        assert_eq!(status.remaining_seconds, Some(300));
    }

    #[tokio::test]
    async fn warning_outcome_counts_down() {
        let tracker = tracker();
        let first = tracker.record("alice", "general", true, T0).await;
        assert_eq!(first.status.consecutive_toxic_count, 1);
        assert_eq!(first.warnings_until_mute, 4);
        assert_eq!(first.toxic_threshold, 5);
        assert_eq!(first.mute_duration_minutes, 5);
    }

    #[tokio::test]
    async fn clean_messages_do_not_reset_the_run() {
        let tracker = tracker();
        tracker.record("bob", "general", true, T0).await;
        tracker.record("bob", "general", true, T0).await;
        let clean = tracker.record("bob", "general", false, T0).await;
        assert_eq!(clean.action, AbuseAction::None);
        assert_eq!(clean.status.consecutive_toxic_count, 2);

        let third = tracker.record("bob", "general", true, T0).await;
        assert_eq!(third.status.consecutive_toxic_count, 3);
    }

    #[tokio::test]
    async fn clean_message_from_stranger_creates_nothing() {
        let tracker = tracker();
        let outcome = tracker.record("carol", "general", false, T0).await;
        assert_eq!(outcome.action, AbuseAction::None);
        assert_eq!(outcome.status, MuteStatus::default());
        assert!(tracker.user_stats("carol", None).await.rooms.is_empty());
    }

    #[tokio::test]
    async fn expiry_reports_just_unmuted_once() {
        let tracker = tracker();
        mute(&tracker, "alice", "general", T0).await;

        let before = tracker.check_status("alice", "general", T0 + Duration::seconds(299)).await;
        assert!(before.is_muted);
        assert_eq!(before.remaining_seconds, Some(1));

        let after = tracker.check_status("alice", "general", T0 + Duration::seconds(300)).await;
        assert!(!after.is_muted);
        assert!(after.just_unmuted);
        assert_eq!(after.mute_expires_at, None);
        assert_eq!(after.remaining_seconds, None);

        let again = tracker.check_status("alice", "general", T0 + Duration::seconds(301)).await;
        assert!(!again.just_unmuted);
        assert_eq!(again.total_mute_count, 1);
    }

    #[tokio::test]
    async fn manual_unmute_before_expiry() {
        let tracker = tracker();
        assert!(!tracker.manual_unmute("alice", "general").await);

        mute(&tracker, "alice", "general", T0).await;
        tracker.record("alice", "general", true, T0).await;

        assert!(tracker.manual_unmute("alice", "general").await);
        let status = tracker.check_status("alice", "general", T0).await;
        assert!(!status.is_muted);
        assert!(!status.just_unmuted);
        assert_eq!(status.consecutive_toxic_count, 0);
        assert!(!tracker.manual_unmute("alice", "general").await);
    }

    #[tokio::test]
    async fn warning_count_keeps_growing_across_mutes() {
        let tracker = tracker();
        mute(&tracker, "alice", "general", T0).await;
        // Recorded toxic while muted still counts.
        tracker.record("alice", "general", true, T0).await;
        let status = tracker.check_status("alice", "general", T0 + Duration::minutes(10)).await;
        assert!(status.just_unmuted);
        assert_eq!(status.warning_count, 6);
        assert_eq!(status.consecutive_toxic_count, 0);

        mute(&tracker, "alice", "general", T0 + Duration::minutes(11)).await;
        let status = tracker.check_status("alice", "general", T0 + Duration::minutes(11)).await;
        assert_eq!(status.warning_count, 11);
        assert_eq!(status.total_mute_count, 2);
    }

    #[tokio::test]
    async fn rooms_are_tracked_separately() {
        let tracker = tracker();
        mute(&tracker, "alice", "general", T0).await;
        tracker.record("alice", "random", true, T0).await;

        assert!(!tracker.check_status("alice", "random", T0).await.is_muted);

        let muted = tracker.muted_users("general", T0).await;
        assert_eq!(muted.len(), 1);
        assert_eq!(muted[0].username, "alice");
        assert!(tracker.muted_users("random", T0).await.is_empty());
        assert!(tracker.muted_users("general", T0 + Duration::minutes(6)).await.is_empty());

        let stats = tracker.user_stats("alice", None).await;
        assert_eq!(stats.total_warnings, 6);
        assert_eq!(stats.total_mutes, 1);
        assert_eq!(stats.rooms.len(), 2);

        let single = tracker.user_stats("alice", Some("random")).await;
        assert_eq!(single.rooms.len(), 1);
        assert_eq!(single.rooms[0].warning_count, 1);

        let empty = tracker.user_stats("alice", Some("lobby")).await;
        assert_eq!(empty.rooms[0].warning_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_toxic_events_mute_exactly_once_per_threshold() {
        let tracker = Arc::new(tracker());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move { tracker.record("mallory", "general", true, T0).await.action })
            })
            .collect();

        let mut mutes = 0;
        for task in tasks {
            if task.await.unwrap() == AbuseAction::Muted {
                mutes += 1;
            }
        }

        assert_eq!(mutes, 4);
        let status = tracker.check_status("mallory", "general", T0).await;
        assert_eq!(status.warning_count, 20);
        assert_eq!(status.total_mute_count, 4);
        assert_eq!(status.consecutive_toxic_count, 0);
    }

    #[tokio::test]
    async fn mutes_survive_a_restart() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::in_memory().await.unwrap());

        let before = AbuseTracker::with_store(MutePolicy::default(), Arc::clone(&store));
        mute(&before, "alice", "general", T0).await;
        before.record("bob", "general", true, T0).await;
        drop(before);

        let after = AbuseTracker::with_store(MutePolicy::default(), Arc::clone(&store));
        let muted = after.muted_users("general", T0 + Duration::seconds(10)).await;
        assert_eq!(muted.len(), 1);
        assert_eq!(muted[0].username, "alice");

        let status = after.check_status("alice", "general", T0 + Duration::seconds(10)).await;
        assert!(status.is_muted);
        assert_eq!(status.mute_expires_at, Some(T0 + Duration::seconds(300)));
        assert_eq!(status.warning_count, 5);
        assert_eq!(status.total_mute_count, 1);

        let bob = after.record("bob", "general", true, T0).await;
        assert_eq!(bob.status.consecutive_toxic_count, 2);
        assert_eq!(after.user_stats("bob", None).await.total_warnings, 2);
    }

    #[tokio::test]
    async fn unmutes_and_expiry_are_written_through() {
        let store: Arc<dyn PersistenceStore> = Arc::new(SqliteStore::in_memory().await.unwrap());

        let first = AbuseTracker::with_store(MutePolicy::default(), Arc::clone(&store));
        mute(&first, "alice", "general", T0).await;
        mute(&first, "carol", "general", T0).await;
        assert!(first.manual_unmute("alice", "general").await);
        assert!(first.check_status("carol", "general", T0 + Duration::minutes(6)).await.just_unmuted);

        let second = AbuseTracker::with_store(MutePolicy::default(), Arc::clone(&store));
        assert!(second.muted_users("general", T0).await.is_empty());

        let carol = second.check_status("carol", "general", T0 + Duration::minutes(7)).await;
        assert!(!carol.is_muted);
        assert!(!carol.just_unmuted);
        assert_eq!(carol.total_mute_count, 1);
    }
}
