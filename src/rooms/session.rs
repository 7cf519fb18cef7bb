//! The per-connection pipeline: mute gate, classification, abuse
//! bookkeeping, persistence and fan-out.

use std::sync::Arc;

use crate::{
    moderation::{score_or_default, AbuseAction, MuteStatus, RecordOutcome},
    AppState,
};

use super::{
    msg::{valid_content, ChatEvent, EventKind, Inbound},
    registry::{Connection, DeliveryError, UNKNOWN_USER},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Connecting,
    Active,
    Closed,
}

pub struct MessageSession {
    state: AppState,
    conn: Arc<Connection>,
    phase: SessionPhase,
}

impl MessageSession {
    pub fn new(state: AppState, conn: Arc<Connection>) -> MessageSession {
        MessageSession {
            state,
            conn,
            phase: SessionPhase::Connecting,
        }
    }

    fn username(&self) -> &str {
        self.conn.username()
    }

    fn room_id(&self) -> &str {
        self.conn.room_id()
    }

    /// Joins the room, tells the client where it stands, and announces it.
    pub async fn activate(&mut self) -> Result<(), DeliveryError> {
        if self.phase != SessionPhase::Connecting {
            return Ok(());
        }

        self.state.registry.connect(&self.conn).await;
        self.phase = SessionPhase::Active;

        if let Err(e) = self.state.store.get_or_create_user(self.username()).await {
            tracing::error!(username = self.username(), error = %e, "could not persist user");
        }

        let status = self
            .state
            .abuse
            .check_status(self.username(), self.room_id(), self.state.clock.now())
            .await;
        self.send(mute_status_event(self.room_id(), &status))?;
        if status.just_unmuted {
            self.announce_unmute(status)?;
        }

        let is_new_member = match self.state.store.join_room(self.username(), self.room_id()).await {
            Ok(is_new) => is_new,
            Err(e) => {
                tracing::error!(username = self.username(), room_id = self.room_id(), error = %e, "could not record membership");
                false
            }
        };

        let presence = if is_new_member {
            ChatEvent::system(EventKind::Join, format!("{} has joined the chat", self.username()))
        } else {
            ChatEvent::system(EventKind::Sync, format!("{} is back", self.username()))
        };
        self.broadcast(presence.about(self.username()).with_users(self.state.registry.members(self.room_id())));

        Ok(())
    }

    /// Processes one frame from the client.
    ///
    /// Only a failure to reach this session's own socket is an error.
    pub async fn handle_payload(&mut self, raw: &str) -> Result<(), DeliveryError> {
        if self.phase != SessionPhase::Active {
            return Ok(());
        }

        match Inbound::parse(raw) {
            Inbound::Delete(message_id) => self.delete(message_id).await,
            Inbound::Chat(content) => self.chat(content).await,
        }
    }

    async fn chat(&mut self, content: String) -> Result<(), DeliveryError> {
        let status = self
            .state
            .abuse
            .check_status(self.username(), self.room_id(), self.state.clock.now())
            .await;
        if status.just_unmuted {
            self.announce_unmute(status.clone())?;
        }

        if status.is_muted {
            let remaining = status.remaining_seconds.unwrap_or_default();
            tracing::debug!(username = self.username(), room_id = self.room_id(), remaining, "rejected muted sender");
            return self.send(
                ChatEvent::system(EventKind::MuteRejected, format!("You are muted. Try again in {remaining} seconds."))
                    .in_room(self.room_id())
                    .with_mute_info(status),
            );
        }

        if !valid_content(&content) {
            return self.send(ChatEvent::system(EventKind::Error, "Failed to process message"));
        }

        let scores = score_or_default(
            self.state.classifier.as_ref(),
            &content,
            self.state.config.classifier_timeout,
        )
        .await;

        let outcome = self
            .state
            .abuse
            .record(self.username(), self.room_id(), scores.is_toxic, self.state.clock.now())
            .await;

        let message_id = match self
            .state
            .store
            .save_message(&content, self.username(), self.room_id(), &scores)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(username = self.username(), room_id = self.room_id(), error = %e, "could not save message");
                None
            }
        };

        self.broadcast(ChatEvent::chat(&content, self.username(), self.room_id(), scores, message_id));

        match outcome.action {
            AbuseAction::None => Ok(()),
            AbuseAction::Warning => self.send(warning_event(self.room_id(), &outcome)),
            AbuseAction::Muted => {
                self.send(
                    ChatEvent::system(
                        EventKind::Muted,
                        format!(
                            "You have been muted for {} minutes for repeated toxic messages.",
                            outcome.mute_duration_minutes
                        ),
                    )
                    .in_room(self.room_id())
                    .with_mute_info(&outcome),
                )?;
                self.broadcast(
                    ChatEvent::system(EventKind::Muted, format!("{} has been muted", self.username()))
                        .about(self.username())
                        .with_mute_info(&outcome),
                );
                Ok(())
            }
        }
    }

    async fn delete(&mut self, message_id: i64) -> Result<(), DeliveryError> {
        match self.state.store.delete_message(message_id, self.username()).await {
            Ok(Some(room_id)) => {
                self.state
                    .router
                    .broadcast_to_room(&delete_event(&room_id, message_id, self.username()), &room_id);
                Ok(())
            }
            Ok(None) => self.send(
                ChatEvent::system(EventKind::Error, "You can only delete your own messages").with_message_id(message_id),
            ),
            Err(e) => {
                tracing::error!(username = self.username(), message_id, error = %e, "could not delete message");
                self.send(ChatEvent::system(EventKind::Error, "Failed to delete message").with_message_id(message_id))
            }
        }
    }

    /// Leaves the room and tells whoever is left. Runs at most once.
    pub fn close(&mut self) {
        let was_active = self.phase == SessionPhase::Active;
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.phase = SessionPhase::Closed;
        self.conn.close();

        if !was_active {
            return;
        }

        let departed = self.state.registry.disconnect(self.conn.id(), self.room_id());
        // An evicted connection was already removed by the router.
        let name = if departed == UNKNOWN_USER { self.username().to_owned() } else { departed };

        self.broadcast(
            ChatEvent::system(EventKind::Leave, format!("{name} has left the chat"))
                .about(&name)
                .with_users(self.state.registry.members(self.room_id())),
        );
    }

    fn announce_unmute(&self, status: MuteStatus) -> Result<(), DeliveryError> {
        self.send(
            ChatEvent::system(EventKind::Unmuted, "Your mute has expired. You can chat again.")
                .in_room(self.room_id())
                .with_mute_info(status),
        )?;
        self.broadcast(unmuted_notice(self.username()));
        Ok(())
    }

    fn send(&self, event: ChatEvent) -> Result<(), DeliveryError> {
        self.state.router.send_to(&self.conn, &event)
    }

    fn broadcast(&self, event: ChatEvent) {
        self.state.router.broadcast_to_room(&event.in_room(self.room_id()), self.room_id());
    }
}

impl Drop for MessageSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn mute_status_event(room_id: &str, status: &MuteStatus) -> ChatEvent {
    let content = match status.remaining_seconds {
        Some(remaining) if status.is_muted => format!("You are muted in this room for {remaining} more seconds."),
        _ => "You are not muted in this room.".to_owned(),
    };
    ChatEvent::system(EventKind::MuteStatus, content)
        .in_room(room_id)
        .with_mute_info(status.clone())
}

fn warning_event(room_id: &str, outcome: &RecordOutcome) -> ChatEvent {
    ChatEvent::system(
        EventKind::Warning,
        format!(
            "Your message was flagged as toxic. {} more and you will be muted for {} minutes.",
            outcome.warnings_until_mute, outcome.mute_duration_minutes
        ),
    )
    .in_room(room_id)
    .with_mute_info(outcome)
}

/// Room-wide notice that `username` may post again.
pub(crate) fn unmuted_notice(username: &str) -> ChatEvent {
    ChatEvent::system(EventKind::Unmuted, format!("{username} has been unmuted")).about(username)
}

pub(crate) fn delete_event(room_id: &str, message_id: i64, requester: &str) -> ChatEvent {
    ChatEvent::system(EventKind::Delete, "Message deleted")
        .in_room(room_id)
        .with_message_id(message_id)
        .about(requester)
}
