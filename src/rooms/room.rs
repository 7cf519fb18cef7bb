use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::Identity,
    clock::Clock,
    db::{PersistenceStore, Room, StoredMessage},
    moderation::{AbuseTracker, MutedUser, UserStats},
    AppError, AppResult, AppState,
};

use super::{
    broadcast::BroadcastRouter,
    msg::{ChatEvent, EventKind},
    registry::{ConnectionRegistry, RoomPresence},
    session::{delete_event, unmuted_notice},
};

const DEFAULT_HISTORY: u32 = 50;
const MAX_HISTORY: u32 = 200;

#[derive(Serialize)]
pub(crate) struct RoomsResponse {
    rooms: Vec<RoomPresence>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn active_rooms(State(registry): State<Arc<ConnectionRegistry>>) -> Json<RoomsResponse> {
    Json(RoomsResponse {
        rooms: registry.active_rooms(),
    })
}

#[derive(Serialize)]
pub(crate) struct RoomUsersResponse {
    room_id: String,
    users: Vec<String>,
    count: usize,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_users(
    Path(room_id): Path<String>,
    State(registry): State<Arc<ConnectionRegistry>>,
) -> Json<RoomUsersResponse> {
    let users = registry.members(&room_id);
    Json(RoomUsersResponse {
        count: users.len(),
        room_id,
        users,
    })
}

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<u32>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_messages(
    Path(room_id): Path<String>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
    State(store): State<Arc<dyn PersistenceStore>>,
) -> AppResult<Json<Vec<StoredMessage>>> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY);
    if !(1..=MAX_HISTORY).contains(&limit) {
        return Err(AppError::BadRequest(format!("limit must be between 1 and {MAX_HISTORY}")));
    }
    Ok(Json(store.recent_messages(&room_id, limit).await?))
}

#[derive(Serialize)]
pub(crate) struct MutedUsersResponse {
    room_id: String,
    muted_users: Vec<MutedUser>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn muted_users(
    Path(room_id): Path<String>,
    State(abuse): State<Arc<AbuseTracker>>,
    State(clock): State<Arc<dyn Clock>>,
) -> Json<MutedUsersResponse> {
    Json(MutedUsersResponse {
        muted_users: abuse.muted_users(&room_id, clock.now()).await,
        room_id,
    })
}

#[derive(Serialize)]
pub(crate) struct UnmuteResponse {
    room_id: String,
    username: String,
    unmuted: bool,
}

/// Only the room's creator may lift a mute early.
#[debug_handler(state = AppState)]
pub(crate) async fn unmute(
    Path((room_id, username)): Path<(String, String)>,
    Identity(requester): Identity,
    State(store): State<Arc<dyn PersistenceStore>>,
    State(abuse): State<Arc<AbuseTracker>>,
    State(router): State<Arc<BroadcastRouter>>,
    State(clock): State<Arc<dyn Clock>>,
) -> AppResult<Json<UnmuteResponse>> {
    let Some(room) = store.room(&room_id).await? else {
        return Err(AppError::NotFound(format!("room {room_id}")));
    };

    if room.created_by.as_deref() != Some(requester.as_str()) {
        tracing::warn!(room_id = %room_id, requester = %requester, "unmute refused");
        return Err(AppError::Forbidden("only the room creator can unmute".to_owned()));
    }

    if !abuse.manual_unmute(&username, &room_id).await {
        return Err(AppError::NotFound(format!("{username} is not muted in {room_id}")));
    }
    tracing::info!(room_id = %room_id, username = %username, requester = %requester, "mute lifted");

    let status = abuse.check_status(&username, &room_id, clock.now()).await;
    let private = ChatEvent::system(EventKind::Unmuted, format!("You have been unmuted by {requester}."))
        .in_room(&room_id)
        .with_mute_info(status);
    for conn in router.registry().connections_of(&username, &room_id) {
        if let Err(e) = router.send_to(&conn, &private) {
            tracing::debug!(conn_id = %conn.id(), error = %e, "unmute notice not delivered");
        }
    }
    router.broadcast_to_room(&unmuted_notice(&username).in_room(&room_id), &room_id);

    Ok(Json(UnmuteResponse {
        room_id,
        username,
        unmuted: true,
    }))
}

#[derive(Serialize)]
pub(crate) struct DeleteResponse {
    message_id: i64,
    room_id: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete_message(
    Path(message_id): Path<i64>,
    Identity(requester): Identity,
    State(store): State<Arc<dyn PersistenceStore>>,
    State(router): State<Arc<BroadcastRouter>>,
) -> AppResult<Json<DeleteResponse>> {
    let Some(room_id) = store.delete_message(message_id, &requester).await? else {
        return Err(AppError::Forbidden("you can only delete your own messages".to_owned()));
    };

    router.broadcast_to_room(&delete_event(&room_id, message_id, &requester), &room_id);

    Ok(Json(DeleteResponse { message_id, room_id }))
}

#[derive(Deserialize)]
pub(crate) struct StatsQuery {
    room_id: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn user_mutes(
    Path(username): Path<String>,
    Query(StatsQuery { room_id }): Query<StatsQuery>,
    State(abuse): State<Arc<AbuseTracker>>,
) -> Json<UserStats> {
    Json(abuse.user_stats(&username, room_id.as_deref()).await)
}

#[debug_handler(state = AppState)]
pub(crate) async fn user_rooms(
    Path(username): Path<String>,
    Identity(requester): Identity,
    State(store): State<Arc<dyn PersistenceStore>>,
) -> AppResult<Json<Vec<Room>>> {
    if requester != username {
        return Err(AppError::Forbidden("you can only list your own rooms".to_owned()));
    }

    Ok(Json(store.rooms_for_user(&username).await?))
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        auth::Auth,
        config::Config,
        db::SqliteStore,
        moderation::DisabledClassifier,
        rooms::registry::{tests::conn, Connection},
    };

    async fn state() -> AppState {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        AppState::new(Config::default(), store.clone(), Auth(store), Arc::new(DisabledClassifier))
    }

    async fn join(state: &AppState, username: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (conn, rx) = conn(username, "general");
        state.registry.connect(&conn).await;
        (conn, rx)
    }

    async fn call_unmute(state: &AppState, requester: &str, username: &str) -> AppResult<Json<UnmuteResponse>> {
        unmute(
            Path(("general".to_owned(), username.to_owned())),
            Identity(requester.to_owned()),
            State(state.store.clone()),
            State(state.abuse.clone()),
            State(state.router.clone()),
            State(state.clock.clone()),
        )
        .await
    }

    fn kinds(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
            kinds.push(json["type"].as_str().unwrap().to_owned());
        }
        kinds
    }

    async fn mute_alice(state: &AppState) {
        for _ in 0..state.config.mute_policy.threshold {
            state.abuse.record("alice", "general", true, state.clock.now()).await;
        }
        assert!(state.abuse.check_status("alice", "general", state.clock.now()).await.is_muted);
    }

    #[tokio::test]
    async fn only_the_creator_can_unmute() {
        let state = state().await;
        state.store.get_or_create_room("general", "carol").await.unwrap();
        let (_alice, mut rx_alice) = join(&state, "alice").await;
        let (_dave, mut rx_dave) = join(&state, "dave").await;
        mute_alice(&state).await;

        let err = call_unmute(&state, "bob", "alice").await.err().unwrap();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
        assert!(state.abuse.check_status("alice", "general", state.clock.now()).await.is_muted);
        assert!(kinds(&mut rx_alice).is_empty());
        assert!(kinds(&mut rx_dave).is_empty());

        let Json(response) = call_unmute(&state, "carol", "alice").await.unwrap();
        assert!(response.unmuted);
        assert!(!state.abuse.check_status("alice", "general", state.clock.now()).await.is_muted);
        assert_eq!(kinds(&mut rx_alice), ["unmuted", "unmuted"]);
        assert_eq!(kinds(&mut rx_dave), ["unmuted"]);
    }

    #[tokio::test]
    async fn unmuting_someone_not_muted_is_not_found() {
        let state = state().await;
        state.store.get_or_create_room("general", "carol").await.unwrap();

        let err = call_unmute(&state, "carol", "alice").await.err().unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let state = state().await;
        let err = call_unmute(&state, "carol", "alice").await.err().unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
