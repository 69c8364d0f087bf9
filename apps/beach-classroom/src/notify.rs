//! Push surface for the rest of the platform (bookings, ratings, messages,
//! announcements). Callers persist their notification first; this push is a
//! best-effort real-time nudge and never fails.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::hub::Hub;
use crate::protocol::{NamedEvent, UserId};
use crate::relay::DeliveryPolicy;

/// Notifications reach every open tab and device of the user.
pub const NOTIFICATION_POLICY: DeliveryPolicy = DeliveryPolicy::PickAll;

pub trait PresenceDirectory: Send + Sync {
    /// Push `event` to all of `user_id`'s live connections. Returns how many
    /// connections the event was queued on; zero for offline users.
    fn deliver_to_user(&self, user_id: &str, event: &str, payload: Value) -> usize;

    fn is_online(&self, user_id: &str) -> bool;

    fn connection_count(&self, user_id: &str) -> usize;
}

impl PresenceDirectory for Hub {
    fn deliver_to_user(&self, user_id: &str, event: &str, payload: Value) -> usize {
        let message = NamedEvent {
            event: event.to_string(),
            data: payload,
        };
        let delivered = self.deliver_to(user_id, NOTIFICATION_POLICY, &message);
        if delivered == 0 {
            debug!(user_id, event, "no live connection for notification");
        } else {
            counter!("beach_classroom_notifications_delivered_total", delivered as u64);
        }
        delivered
    }

    fn is_online(&self, user_id: &str) -> bool {
        Hub::is_online(self, user_id)
    }

    fn connection_count(&self, user_id: &str) -> usize {
        self.connections_of(user_id).len()
    }
}

#[derive(Debug, Deserialize)]
pub struct PushEventRequest {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct PushEventResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub is_online: bool,
    pub connections: usize,
}

/// Internal routes for collaborators running out of process.
pub fn routes<D>(directory: D) -> Router
where
    D: PresenceDirectory + Clone + 'static,
{
    Router::new()
        .route("/internal/users/:user_id/events", post(push_event::<D>))
        .route("/internal/users/:user_id/presence", get(presence::<D>))
        .with_state(directory)
}

/// POST /internal/users/{user_id}/events - push an event to a user's devices
async fn push_event<D>(
    State(directory): State<D>,
    Path(user_id): Path<String>,
    Json(request): Json<PushEventRequest>,
) -> Result<Json<PushEventResponse>, StatusCode>
where
    D: PresenceDirectory + Clone + 'static,
{
    if request.event.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let delivered = directory.deliver_to_user(&user_id, &request.event, request.payload);
    Ok(Json(PushEventResponse { delivered }))
}

/// GET /internal/users/{user_id}/presence
async fn presence<D>(State(directory): State<D>, Path(user_id): Path<String>) -> Json<PresenceResponse>
where
    D: PresenceDirectory + Clone + 'static,
{
    Json(PresenceResponse {
        is_online: directory.is_online(&user_id),
        connections: directory.connection_count(&user_id),
        user_id,
    })
}
