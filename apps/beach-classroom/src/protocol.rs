use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type UserId = String;
pub type RoomId = String;

/// Events sent from a browser client to the classroom hub.
///
/// Identity fields are optional on the wire so that a frame missing them still
/// decodes; the hub ignores such events instead of treating them as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Bind this connection to a user identity.
    Register { user_id: Option<UserId> },
    /// Join a two-party call room.
    JoinRoom {
        room_id: Option<RoomId>,
        user_id: Option<UserId>,
    },
    /// Leave a call room explicitly.
    LeaveRoom {
        room_id: Option<RoomId>,
        user_id: Option<UserId>,
    },
    SendOffer {
        #[serde(default)]
        offer: Value,
        to_user_id: Option<UserId>,
        from_user_id: Option<UserId>,
        room_id: Option<RoomId>,
    },
    SendAnswer {
        #[serde(default)]
        answer: Value,
        to_user_id: Option<UserId>,
        from_user_id: Option<UserId>,
    },
    SendIceCandidate {
        #[serde(default)]
        candidate: Value,
        to_user_id: Option<UserId>,
        from_user_id: Option<UserId>,
    },
    Typing {
        #[serde(default)]
        booking_id: Value,
    },
    #[serde(rename = "stopTyping")]
    StopTyping {
        #[serde(default)]
        booking_id: Value,
    },
    /// Heartbeat to keep connection alive
    Ping,
}

/// Events sent from the classroom hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Every known user with their online flag, sent to a registrant.
    #[serde(rename = "initializeStatus")]
    InitializeStatus(Vec<(UserId, bool)>),
    #[serde(rename = "updateOnlineUsers")]
    UpdateOnlineUsers(Vec<UserId>),
    #[serde(rename = "userStatusChanged")]
    UserStatusChanged { user_id: UserId, is_online: bool },
    /// Other members already in the room, sent to the joiner.
    #[serde(rename = "room-users")]
    RoomUsers(Vec<UserId>),
    #[serde(rename = "user-connected")]
    UserConnected(UserId),
    #[serde(rename = "user-disconnected")]
    UserDisconnected(UserId),
    #[serde(rename = "room-full")]
    RoomFull(RoomId),
    #[serde(rename = "receive-offer")]
    ReceiveOffer {
        offer: Value,
        from_user_id: UserId,
        room_id: Option<RoomId>,
    },
    #[serde(rename = "receive-answer")]
    ReceiveAnswer { answer: Value, from_user_id: UserId },
    #[serde(rename = "receive-ice-candidate")]
    ReceiveIceCandidate {
        candidate: Value,
        from_user_id: UserId,
    },
    #[serde(rename = "typing")]
    Typing { booking_id: Value },
    #[serde(rename = "stopTyping")]
    StopTyping { booking_id: Value },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::InitializeStatus(_) => "initializeStatus",
            ServerMessage::UpdateOnlineUsers(_) => "updateOnlineUsers",
            ServerMessage::UserStatusChanged { .. } => "userStatusChanged",
            ServerMessage::RoomUsers(_) => "room-users",
            ServerMessage::UserConnected(_) => "user-connected",
            ServerMessage::UserDisconnected(_) => "user-disconnected",
            ServerMessage::RoomFull(_) => "room-full",
            ServerMessage::ReceiveOffer { .. } => "receive-offer",
            ServerMessage::ReceiveAnswer { .. } => "receive-answer",
            ServerMessage::ReceiveIceCandidate { .. } => "receive-ice-candidate",
            ServerMessage::Typing { .. } => "typing",
            ServerMessage::StopTyping { .. } => "stopTyping",
            ServerMessage::Pong => "pong",
        }
    }
}

/// Free-form event pushed on behalf of the rest of the platform
/// (`newNotification`, `newMessage`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid message payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("binary frame is not valid utf-8")]
    NotUtf8,
}

impl FrameError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            FrameError::InvalidJson(_) => "invalid_json",
            FrameError::NotUtf8 => "not_utf8",
        }
    }
}

/// Decode an inbound websocket frame. Control frames yield `Ok(None)`.
///
/// Binary frames are accepted when they carry UTF-8 JSON, matching what older
/// clients send.
pub fn decode_frame(message: &Message) -> Result<Option<ClientMessage>, FrameError> {
    match message {
        Message::Text(text) => Ok(Some(serde_json::from_str(text)?)),
        Message::Binary(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
            Ok(Some(serde_json::from_str(text)?))
        }
        _ => Ok(None),
    }
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Message, FrameError> {
    Ok(Message::Text(serde_json::to_string(message)?))
}
