mod broadcast;
mod msg;
mod registry;
mod room;
mod session;
mod ws;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::AppState;

pub use broadcast::BroadcastRouter;
pub use msg::{valid_content, valid_sender, ChatEvent, EventKind, Inbound, MuteInfo, MAX_CONTENT_CHARS, MAX_SENDER_CHARS, SYSTEM_SENDER};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, DeliveryError, RoomPresence, UNKNOWN_USER};
pub use session::MessageSession;

/// The socket endpoint, mounted at the root.
pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws/{room_id}", get(ws::room_ws))
}

/// Room, history and moderation endpoints, nested under `/chat`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(room::active_rooms))
        .route("/rooms/{room_id}/users", get(room::room_users))
        .route("/rooms/{room_id}/messages", get(room::room_messages))
        .route("/rooms/{room_id}/mutes", get(room::muted_users))
        .route("/rooms/{room_id}/mutes/{username}/unmute", post(room::unmute))
        .route("/messages/{message_id}", delete(room::delete_message))
        .route("/users/{username}/mutes", get(room::user_mutes))
        .route("/users/{username}/rooms", get(room::user_rooms))
}
