use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::AppState;

use super::{registry::Connection, session::MessageSession};

#[derive(Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<String>,
    Query(WsQuery { token }): Query<WsQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let username = match token {
        Some(token) => state.auth.0.resolve(&token).await,
        None => None,
    };

    ws.on_upgrade(async move |mut stream| {
        let Some(username) = username.filter(|name| super::msg::valid_sender(name)) else {
            tracing::warn!(room_id = %room_id, "rejected unauthenticated websocket");
            let _ = stream
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        };

        run_session(state, stream, username, room_id).await;
    })
}

async fn run_session(state: AppState, stream: WebSocket, username: String, room_id: String) {
    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.config.outbound_queue);
    let conn = Connection::new(&username, &room_id, tx);
    let (mut sender, mut receiver) = stream.split();

    let writer_conn = Arc::clone(&conn);
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                _ = writer_conn.closed() => break,
            }
        }
        let _ = sender.close().await;
    });

    let mut session = MessageSession::new(state, Arc::clone(&conn));
    if session.activate().await.is_err() {
        session.close();
        writer.abort();
        return;
    }

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                };

                if let Err(e) = session.handle_payload(&text).await {
                    tracing::debug!(username = %username, room_id = %room_id, error = %e, "lost own connection");
                    break;
                }
            }
            _ = conn.closed() => break,
            _ = &mut writer => break,
        }
    }

    session.close();
    writer.abort();
}
