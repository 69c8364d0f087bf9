//! Presence snapshots derived from the connection registry.
//!
//! The online list is always rebuilt from a whole registry snapshot instead of
//! being patched incrementally, so every client sees a list that matched the
//! registry at one instant.

use metrics::gauge;

use crate::protocol::{ServerMessage, UserId};
use crate::registry::ConnectionRegistry;

/// `updateOnlineUsers`, broadcast after every registration change.
pub fn online_list(registry: &ConnectionRegistry) -> ServerMessage {
    let online = registry.online_users();
    gauge!("beach_classroom_users_online", online.len() as f64);
    ServerMessage::UpdateOnlineUsers(online)
}

/// `initializeStatus`, sent to a registrant only. Includes offline users.
pub fn status_dump(registry: &ConnectionRegistry) -> ServerMessage {
    ServerMessage::InitializeStatus(registry.snapshot())
}

pub fn status_changed(user_id: &UserId, is_online: bool) -> ServerMessage {
    ServerMessage::UserStatusChanged {
        user_id: user_id.clone(),
        is_online,
    }
}
