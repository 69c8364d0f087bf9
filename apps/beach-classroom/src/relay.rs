use serde_json::Value;
use thiserror::Error;

use crate::protocol::{RoomId, ServerMessage, UserId};
use crate::registry::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn label(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }
}

/// Which of a user's live connections receive a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Oldest live connection only.
    PickOne,
    /// Every live connection.
    PickAll,
}

impl DeliveryPolicy {
    pub fn select(self, connections: &[ConnectionId]) -> &[ConnectionId] {
        match self {
            DeliveryPolicy::PickOne => &connections[..connections.len().min(1)],
            DeliveryPolicy::PickAll => connections,
        }
    }
}

/// Offers, answers and candidates go to a single device: two tabs answering
/// the same offer would start competing peer connections.
// TODO: revisit once clients can pin the device that accepted the call; the
// relay could then target that connection instead of the oldest one.
pub const SIGNAL_POLICY: DeliveryPolicy = DeliveryPolicy::PickOne;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSignal {
    #[error("signal has no recipient")]
    MissingRecipient,
    #[error("signal sender is unknown")]
    MissingSender,
}

/// One relay hop. The payload is opaque and forwarded untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub room_id: Option<RoomId>,
    pub payload: Value,
}

impl SignalEnvelope {
    /// Build an envelope from client supplied fields. When the client omits
    /// `fromUserId` the identity bound to its connection is used instead.
    pub fn new(
        kind: SignalKind,
        payload: Value,
        to_user_id: Option<UserId>,
        from_user_id: Option<UserId>,
        room_id: Option<RoomId>,
        bound_user: Option<&UserId>,
    ) -> Result<Self, InvalidSignal> {
        let to_user_id = non_blank(to_user_id).ok_or(InvalidSignal::MissingRecipient)?;
        let from_user_id = non_blank(from_user_id)
            .or_else(|| bound_user.cloned())
            .ok_or(InvalidSignal::MissingSender)?;

        Ok(Self {
            kind,
            from_user_id,
            to_user_id,
            room_id: non_blank(room_id),
            payload,
        })
    }

    pub fn into_message(self) -> ServerMessage {
        match self.kind {
            SignalKind::Offer => ServerMessage::ReceiveOffer {
                offer: self.payload,
                from_user_id: self.from_user_id,
                room_id: self.room_id,
            },
            SignalKind::Answer => ServerMessage::ReceiveAnswer {
                answer: self.payload,
                from_user_id: self.from_user_id,
            },
            SignalKind::IceCandidate => ServerMessage::ReceiveIceCandidate {
                candidate: self.payload,
                from_user_id: self.from_user_id,
            },
        }
    }
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
