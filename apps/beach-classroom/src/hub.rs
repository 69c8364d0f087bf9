use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::presence;
use crate::protocol::{encode_frame, ClientMessage, RoomId, ServerMessage, UserId};
use crate::registry::{ConnectionId, ConnectionRegistry, Deregistration};
use crate::relay::{non_blank, DeliveryPolicy, SignalEnvelope, SignalKind, SIGNAL_POLICY};
use crate::rooms::{JoinOutcome, LeaveOutcome, RoomCoordinator};

const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub per_connection_buffer: usize,
    pub heartbeat_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Process-wide presence and call coordinator.
///
/// Registry and rooms sit behind one mutex so that every inbound event is a
/// single atomic transition, and outbound frames are queued while the lock is
/// held so all clients observe broadcasts in the same order. Queuing never
/// blocks: each connection has a bounded channel drained by its writer task.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    state: Mutex<HubState>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    config: HubConfig,
    epoch: Instant,
}

#[derive(Default)]
struct HubState {
    registry: ConnectionRegistry,
    rooms: RoomCoordinator,
}

struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    last_seen: AtomicU64,
}

pub struct Attachment {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::Receiver<Message>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection {0} is not attached")]
    Detached(ConnectionId),
    #[error("outbound buffer full for connection {0}")]
    Full(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

impl DeliveryError {
    fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::Detached(_) => "detached",
            DeliveryError::Full(_) => "buffer_full",
            DeliveryError::Closed(_) => "closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub online_users: Vec<UserId>,
    pub known_users: usize,
    pub attached_connections: usize,
    pub registered_connections: usize,
    pub rooms: Vec<RoomStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStatus {
    pub room_id: RoomId,
    pub members: Vec<UserId>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                connections: DashMap::new(),
                config,
                epoch: Instant::now(),
            }),
        }
    }

    /// Accept a transport connection. The returned receiver must be drained
    /// into the socket by the caller.
    pub fn attach(&self) -> Attachment {
        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.inner.config.per_connection_buffer);
        self.inner.connections.insert(
            connection_id,
            ConnectionHandle {
                sender,
                last_seen: AtomicU64::new(self.now_millis()),
            },
        );
        counter!("beach_classroom_connections_opened_total", 1);
        gauge!(
            "beach_classroom_connections_attached",
            self.inner.connections.len() as f64
        );

        Attachment {
            connection_id,
            receiver,
        }
    }

    /// Transport close: deregister the connection and, if it was the user's
    /// last one, take the user out of every room.
    pub fn detach(&self, connection_id: &ConnectionId) {
        self.inner.connections.remove(connection_id);
        counter!("beach_classroom_connections_closed_total", 1);
        gauge!(
            "beach_classroom_connections_attached",
            self.inner.connections.len() as f64
        );

        let mut state = self.inner.state.lock();
        if let Some(removal) = state.registry.deregister(*connection_id) {
            debug!(
                user_id = %removal.user_id,
                connection_id = %connection_id,
                remaining = state.registry.connections_of(&removal.user_id).len(),
                "connection deregistered"
            );
            self.on_deregistered(&mut state, removal);
        }
    }

    /// Record inbound activity for heartbeat expiry. Returns false once the
    /// connection has been detached or reaped; the caller should stop reading.
    pub fn touch(&self, connection_id: &ConnectionId) -> bool {
        match self.inner.connections.get(connection_id) {
            Some(handle) => {
                handle.last_seen.store(self.now_millis(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Route one inbound event to the component that owns it.
    pub fn dispatch(&self, connection_id: &ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Register { user_id } => match non_blank(user_id) {
                Some(user_id) => self.register(connection_id, &user_id),
                None => debug!(connection_id = %connection_id, "register without user id ignored"),
            },
            ClientMessage::JoinRoom { room_id, user_id } => {
                match (non_blank(room_id), non_blank(user_id)) {
                    (Some(room_id), Some(user_id)) => {
                        self.join_room(connection_id, &room_id, &user_id)
                    }
                    (room_id, user_id) => debug!(
                        connection_id = %connection_id,
                        ?room_id,
                        ?user_id,
                        "invalid join-room request ignored"
                    ),
                }
            }
            ClientMessage::LeaveRoom { room_id, user_id } => {
                match (non_blank(room_id), non_blank(user_id)) {
                    (Some(room_id), Some(user_id)) => self.leave_room(&room_id, &user_id),
                    (room_id, user_id) => debug!(
                        connection_id = %connection_id,
                        ?room_id,
                        ?user_id,
                        "invalid leave-room request ignored"
                    ),
                }
            }
            ClientMessage::SendOffer {
                offer,
                to_user_id,
                from_user_id,
                room_id,
            } => self.relay_from(
                connection_id,
                SignalKind::Offer,
                offer,
                to_user_id,
                from_user_id,
                room_id,
            ),
            ClientMessage::SendAnswer {
                answer,
                to_user_id,
                from_user_id,
            } => self.relay_from(
                connection_id,
                SignalKind::Answer,
                answer,
                to_user_id,
                from_user_id,
                None,
            ),
            ClientMessage::SendIceCandidate {
                candidate,
                to_user_id,
                from_user_id,
            } => self.relay_from(
                connection_id,
                SignalKind::IceCandidate,
                candidate,
                to_user_id,
                from_user_id,
                None,
            ),
            ClientMessage::Typing { booking_id } => {
                self.broadcast_except(connection_id, &ServerMessage::Typing { booking_id })
            }
            ClientMessage::StopTyping { booking_id } => {
                self.broadcast_except(connection_id, &ServerMessage::StopTyping { booking_id })
            }
            ClientMessage::Ping => {
                self.send_message(connection_id, &ServerMessage::Pong);
            }
        }
    }

    fn register(&self, connection_id: &ConnectionId, user_id: &UserId) {
        let mut state = self.inner.state.lock();
        self.register_locked(&mut state, connection_id, user_id);
    }

    /// Returns false when nothing was bound.
    fn register_locked(
        &self,
        state: &mut HubState,
        connection_id: &ConnectionId,
        user_id: &UserId,
    ) -> bool {
        // The reaper drops the handle before taking the state lock, so a
        // missing handle here means the connection is already gone.
        if !self.inner.connections.contains_key(connection_id) {
            debug!(connection_id = %connection_id, user_id = %user_id, "register from detached connection ignored");
            return false;
        }
        let Some(registration) = state.registry.register(user_id, *connection_id) else {
            return false;
        };

        if let Some(released) = registration.released {
            info!(
                user_id = %released.user_id,
                connection_id = %connection_id,
                "connection re-registered under a different user"
            );
            self.on_deregistered(state, released);
        }

        if registration.came_online {
            info!(user_id = %user_id, "user online");
            self.broadcast(&presence::status_changed(user_id, true));
        }

        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            connections = state.registry.connections_of(user_id).len(),
            "user registered"
        );
        self.send_message(connection_id, &presence::status_dump(&state.registry));
        self.broadcast(&presence::online_list(&state.registry));
        true
    }

    fn on_deregistered(&self, state: &mut HubState, removal: Deregistration) {
        if !removal.went_offline {
            return;
        }

        info!(user_id = %removal.user_id, "user offline");
        self.broadcast(&presence::status_changed(&removal.user_id, false));
        self.broadcast(&presence::online_list(&state.registry));

        for outcome in state.rooms.leave_all(&removal.user_id) {
            info!(
                user_id = %removal.user_id,
                room_id = %outcome.room_id,
                "user removed from room on disconnect"
            );
            self.notify_left(&state.registry, &removal.user_id, &outcome);
        }
        gauge!("beach_classroom_rooms_active", state.rooms.len() as f64);
    }

    fn join_room(&self, connection_id: &ConnectionId, room_id: &RoomId, user_id: &UserId) {
        let mut state = self.inner.state.lock();

        // Membership must belong to the connection's user so that disconnect
        // cleanup reaches it: an unbound connection is bound, a connection
        // bound to someone else is rebound.
        if state.registry.user_of(connection_id) != Some(user_id)
            && !self.register_locked(&mut state, connection_id, user_id)
        {
            return;
        }

        match state.rooms.join(room_id, user_id) {
            JoinOutcome::Created => {
                info!(room_id = %room_id, user_id = %user_id, "room created");
                self.send_message(connection_id, &ServerMessage::RoomUsers(Vec::new()));
            }
            JoinOutcome::Rejoined { others } => {
                debug!(room_id = %room_id, user_id = %user_id, "user rejoined room");
                self.send_message(connection_id, &ServerMessage::RoomUsers(others));
            }
            JoinOutcome::Joined { others } => {
                info!(room_id = %room_id, user_id = %user_id, "user joined room");
                let joined = ServerMessage::UserConnected(user_id.clone());
                for other in &others {
                    self.deliver_locked(&state.registry, other, DeliveryPolicy::PickAll, &joined);
                }
                self.send_message(connection_id, &ServerMessage::RoomUsers(others));
            }
            JoinOutcome::Full => {
                info!(
                    room_id = %room_id,
                    user_id = %user_id,
                    members = ?state.rooms.members(room_id),
                    "rejecting join, room is full"
                );
                counter!("beach_classroom_room_full_total", 1);
                self.send_message(connection_id, &ServerMessage::RoomFull(room_id.clone()));
            }
        }
        gauge!("beach_classroom_rooms_active", state.rooms.len() as f64);
    }

    fn leave_room(&self, room_id: &RoomId, user_id: &UserId) {
        let mut state = self.inner.state.lock();
        let Some(outcome) = state.rooms.leave(room_id, user_id) else {
            debug!(room_id = %room_id, user_id = %user_id, "leave for non-member ignored");
            return;
        };

        info!(
            room_id = %room_id,
            user_id = %user_id,
            closed = outcome.closed,
            "user left room"
        );
        self.notify_left(&state.registry, user_id, &outcome);
        gauge!("beach_classroom_rooms_active", state.rooms.len() as f64);
    }

    fn notify_left(&self, registry: &ConnectionRegistry, user_id: &UserId, outcome: &LeaveOutcome) {
        let left = ServerMessage::UserDisconnected(user_id.clone());
        for member in &outcome.remaining {
            self.deliver_locked(registry, member, DeliveryPolicy::PickAll, &left);
        }
    }

    fn relay_from(
        &self,
        connection_id: &ConnectionId,
        kind: SignalKind,
        payload: serde_json::Value,
        to_user_id: Option<UserId>,
        from_user_id: Option<UserId>,
        room_id: Option<RoomId>,
    ) {
        let state = self.inner.state.lock();
        let envelope = match SignalEnvelope::new(
            kind,
            payload,
            to_user_id,
            from_user_id,
            room_id,
            state.registry.user_of(connection_id),
        ) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(connection_id = %connection_id, kind = kind.label(), "dropping signal: {err}");
                return;
            }
        };

        let to_user_id = envelope.to_user_id.clone();
        let from_user_id = envelope.from_user_id.clone();
        let delivered = self.deliver_locked(
            &state.registry,
            &to_user_id,
            SIGNAL_POLICY,
            &envelope.into_message(),
        );
        if delivered == 0 {
            debug!(
                kind = kind.label(),
                from_user_id = %from_user_id,
                to_user_id = %to_user_id,
                "recipient has no live connection, signal dropped"
            );
            counter!("beach_classroom_signals_dropped_total", 1, "kind" => kind.label());
        } else {
            debug!(
                kind = kind.label(),
                from_user_id = %from_user_id,
                to_user_id = %to_user_id,
                "signal relayed"
            );
            counter!("beach_classroom_signals_relayed_total", 1, "kind" => kind.label());
        }
    }

    /// Send `message` to `user_id`'s connections chosen by `policy`. Returns the
    /// number of connections the frame was queued on.
    pub(crate) fn deliver_to<T: Serialize>(
        &self,
        user_id: &str,
        policy: DeliveryPolicy,
        message: &T,
    ) -> usize {
        let state = self.inner.state.lock();
        self.deliver_locked(&state.registry, user_id, policy, message)
    }

    fn deliver_locked<T: Serialize>(
        &self,
        registry: &ConnectionRegistry,
        user_id: &str,
        policy: DeliveryPolicy,
        message: &T,
    ) -> usize {
        let targets = policy.select(registry.connections_of(user_id));
        if targets.is_empty() {
            return 0;
        }
        let Some(frame) = self.encode(message) else {
            return 0;
        };

        targets
            .iter()
            .filter(|connection_id| self.queue(connection_id, frame.clone()))
            .count()
    }

    fn send_message(&self, connection_id: &ConnectionId, message: &ServerMessage) -> bool {
        match self.encode(message) {
            Some(frame) => self.queue(connection_id, frame),
            None => false,
        }
    }

    fn broadcast(&self, message: &ServerMessage) {
        if let Some(frame) = self.encode(message) {
            self.fan_out(None, frame);
        }
    }

    fn broadcast_except(&self, source: &ConnectionId, message: &ServerMessage) {
        let _state = self.inner.state.lock();
        if let Some(frame) = self.encode(message) {
            self.fan_out(Some(source), frame);
        }
    }

    fn fan_out(&self, skip: Option<&ConnectionId>, frame: Message) {
        for entry in self.inner.connections.iter() {
            if Some(entry.key()) == skip {
                continue;
            }
            if let Err(err) = try_queue(*entry.key(), &entry.sender, frame.clone()) {
                record_delivery_failure(&err);
            }
        }
    }

    fn queue(&self, connection_id: &ConnectionId, frame: Message) -> bool {
        let result = match self.inner.connections.get(connection_id) {
            Some(handle) => try_queue(*connection_id, &handle.sender, frame),
            None => Err(DeliveryError::Detached(*connection_id)),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                record_delivery_failure(&err);
                false
            }
        }
    }

    fn encode<T: Serialize>(&self, message: &T) -> Option<Message> {
        match encode_frame(message) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!("failed to encode outbound frame: {err}");
                None
            }
        }
    }

    /// Evict registry entries whose transport connection is gone. A connection
    /// counts as gone when its writer has stopped or it has been silent for
    /// longer than the heartbeat timeout; silent ones are sent a close frame.
    pub fn reap_stale(&self) -> usize {
        self.reap_stale_at(self.now_millis())
    }

    pub fn reap_stale_at(&self, now: u64) -> usize {
        let timeout = self.inner.config.heartbeat_timeout.as_millis() as u64;
        let expired: Vec<(ConnectionId, bool)> = self
            .inner
            .connections
            .iter()
            .filter_map(|entry| {
                let silent =
                    now.saturating_sub(entry.last_seen.load(Ordering::Relaxed)) > timeout;
                let closed = entry.sender.is_closed();
                (silent || closed).then_some((*entry.key(), silent))
            })
            .collect();

        for (connection_id, silent) in expired {
            let Some((_, handle)) = self.inner.connections.remove(&connection_id) else {
                continue;
            };
            if silent {
                warn!(connection_id = %connection_id, "closing connection after heartbeat timeout");
                let _ = handle.sender.try_send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Owned("heartbeat timeout".into()),
                })));
            }
        }

        let mut state = self.inner.state.lock();
        let connections = &self.inner.connections;
        let stale = state.registry.reconcile(|id| connections.contains_key(id));
        let reaped = stale.len();
        for removal in stale {
            info!(
                user_id = %removal.user_id,
                connection_id = %removal.connection_id,
                "reaped stale connection"
            );
            counter!("beach_classroom_stale_connections_reaped_total", 1);
            self.on_deregistered(&mut state, removal);
        }
        gauge!(
            "beach_classroom_connections_attached",
            self.inner.connections.len() as f64
        );
        reaped
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.state.lock().registry.is_online(user_id)
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.inner
            .state
            .lock()
            .registry
            .connections_of(user_id)
            .to_vec()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.inner.state.lock().registry.online_users()
    }

    pub fn room_members(&self, room_id: &str) -> Vec<UserId> {
        self.inner.state.lock().rooms.members(room_id).to_vec()
    }

    pub fn status(&self) -> HubStatus {
        let state = self.inner.state.lock();
        HubStatus {
            online_users: state.registry.online_users(),
            known_users: state.registry.snapshot().len(),
            attached_connections: self.inner.connections.len(),
            registered_connections: state.registry.recorded_connections(),
            rooms: state
                .rooms
                .iter()
                .map(|(room_id, members)| RoomStatus {
                    room_id: room_id.clone(),
                    members: members.to_vec(),
                })
                .collect(),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }
}

fn try_queue(
    connection_id: ConnectionId,
    sender: &mpsc::Sender<Message>,
    frame: Message,
) -> Result<(), DeliveryError> {
    sender.try_send(frame).map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => DeliveryError::Full(connection_id),
        mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(connection_id),
    })
}

fn record_delivery_failure(err: &DeliveryError) {
    debug!("outbound frame dropped: {err}");
    counter!(
        "beach_classroom_outbound_dropped_total",
        1,
        "reason" => err.metric_label()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NamedEvent;
    use serde_json::json;

    fn hub() -> Hub {
        Hub::new(HubConfig::default())
    }

    fn drain(attachment: &mut Attachment) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = attachment.receiver.try_recv() {
            if let Message::Text(text) = frame {
                if let Ok(message) = serde_json::from_str::<ServerMessage>(&text) {
                    out.push(message);
                }
            }
        }
        out
    }

    fn register(hub: &Hub, attachment: &Attachment, user_id: &str) {
        hub.dispatch(
            &attachment.connection_id,
            ClientMessage::Register {
                user_id: Some(user_id.into()),
            },
        );
    }

    fn join(hub: &Hub, attachment: &Attachment, room_id: &str, user_id: &str) {
        hub.dispatch(
            &attachment.connection_id,
            ClientMessage::JoinRoom {
                room_id: Some(room_id.into()),
                user_id: Some(user_id.into()),
            },
        );
    }

    fn offer(hub: &Hub, from: &Attachment, from_user: &str, to_user: &str) {
        hub.dispatch(
            &from.connection_id,
            ClientMessage::SendOffer {
                offer: json!({"type": "offer", "sdp": "v=0"}),
                to_user_id: Some(to_user.into()),
                from_user_id: Some(from_user.into()),
                room_id: Some("r1".into()),
            },
        );
    }

    fn status_changes(messages: &[ServerMessage]) -> Vec<(String, bool)> {
        messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::UserStatusChanged { user_id, is_online } => {
                    Some((user_id.clone(), *is_online))
                }
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn registration_sends_status_dump_and_online_list() {
        let hub = hub();
        let mut observer = hub.attach();
        let mut alice = hub.attach();

        register(&hub, &alice, "alice");

        let to_alice = drain(&mut alice);
        assert_eq!(
            to_alice,
            vec![
                ServerMessage::UserStatusChanged {
                    user_id: "alice".into(),
                    is_online: true
                },
                ServerMessage::InitializeStatus(vec![("alice".into(), true)]),
                ServerMessage::UpdateOnlineUsers(vec!["alice".into()]),
            ]
        );
        let to_observer = drain(&mut observer);
        assert!(to_observer
            .iter()
            .all(|m| !matches!(m, ServerMessage::InitializeStatus(_))));
        assert!(to_observer.contains(&ServerMessage::UpdateOnlineUsers(vec!["alice".into()])));
    }

    #[test_timeout::timeout]
    fn duplicate_register_does_not_repeat_status_change() {
        let hub = hub();
        let mut observer = hub.attach();
        let alice = hub.attach();

        register(&hub, &alice, "alice");
        register(&hub, &alice, "alice");

        let messages = drain(&mut observer);
        assert_eq!(status_changes(&messages), vec![("alice".into(), true)]);
        assert_eq!(hub.connections_of("alice"), vec![alice.connection_id]);
    }

    #[test_timeout::timeout]
    fn user_goes_offline_after_last_connection_detaches() {
        let hub = hub();
        let mut observer = hub.attach();
        let c1 = hub.attach();
        let c2 = hub.attach();
        register(&hub, &c1, "alice");
        register(&hub, &c2, "alice");
        assert_eq!(hub.connections_of("alice").len(), 2);
        drain(&mut observer);

        hub.detach(&c1.connection_id);
        assert!(hub.is_online("alice"));
        assert!(status_changes(&drain(&mut observer)).is_empty());

        hub.detach(&c2.connection_id);
        assert!(!hub.is_online("alice"));
        let messages = drain(&mut observer);
        assert_eq!(status_changes(&messages), vec![("alice".into(), false)]);
        assert!(messages.contains(&ServerMessage::UpdateOnlineUsers(Vec::new())));
    }

    #[test_timeout::timeout]
    fn third_participant_is_rejected_without_mutation() {
        let hub = hub();
        let mut a = hub.attach();
        let mut b = hub.attach();
        let mut c = hub.attach();
        register(&hub, &a, "alice");
        register(&hub, &b, "bob");
        register(&hub, &c, "carol");
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        join(&hub, &a, "r1", "alice");
        assert_eq!(drain(&mut a), vec![ServerMessage::RoomUsers(Vec::new())]);

        join(&hub, &b, "r1", "bob");
        assert_eq!(drain(&mut a), vec![ServerMessage::UserConnected("bob".into())]);
        assert_eq!(drain(&mut b), vec![ServerMessage::RoomUsers(vec!["alice".into()])]);

        join(&hub, &c, "r1", "carol");
        assert_eq!(drain(&mut c), vec![ServerMessage::RoomFull("r1".into())]);
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());
        assert_eq!(hub.room_members("r1"), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test_timeout::timeout]
    fn rejoin_only_replies_to_the_requester() {
        let hub = hub();
        let mut a = hub.attach();
        let mut b = hub.attach();
        register(&hub, &a, "alice");
        register(&hub, &b, "bob");
        join(&hub, &a, "r1", "alice");
        join(&hub, &b, "r1", "bob");
        drain(&mut a);
        drain(&mut b);

        join(&hub, &b, "r1", "bob");
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![ServerMessage::RoomUsers(vec!["alice".into()])]);
    }

    #[test_timeout::timeout]
    fn offer_reaches_exactly_one_recipient_connection() {
        let hub = hub();
        let a = hub.attach();
        let mut c3 = hub.attach();
        let mut c4 = hub.attach();
        register(&hub, &a, "alice");
        register(&hub, &c3, "bob");
        register(&hub, &c4, "bob");
        drain(&mut c3);
        drain(&mut c4);

        offer(&hub, &a, "alice", "bob");

        let received: usize = [drain(&mut c3), drain(&mut c4)]
            .iter()
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| matches!(m, ServerMessage::ReceiveOffer { .. }))
                    .count()
            })
            .sum();
        assert_eq!(received, 1);
    }

    #[test_timeout::timeout]
    fn answer_and_candidate_follow_the_same_single_device_rule() {
        let hub = hub();
        let a = hub.attach();
        let mut b1 = hub.attach();
        let mut b2 = hub.attach();
        register(&hub, &a, "alice");
        register(&hub, &b1, "bob");
        register(&hub, &b2, "bob");
        drain(&mut b1);
        drain(&mut b2);

        hub.dispatch(
            &a.connection_id,
            ClientMessage::SendAnswer {
                answer: json!({"type": "answer"}),
                to_user_id: Some("bob".into()),
                from_user_id: None,
            },
        );
        hub.dispatch(
            &a.connection_id,
            ClientMessage::SendIceCandidate {
                candidate: json!({"candidate": "candidate:0"}),
                to_user_id: Some("bob".into()),
                from_user_id: Some("alice".into()),
            },
        );

        assert_eq!(
            drain(&mut b1),
            vec![
                ServerMessage::ReceiveAnswer {
                    answer: json!({"type": "answer"}),
                    from_user_id: "alice".into(),
                },
                ServerMessage::ReceiveIceCandidate {
                    candidate: json!({"candidate": "candidate:0"}),
                    from_user_id: "alice".into(),
                },
            ]
        );
        assert!(drain(&mut b2).is_empty());
    }

    #[test_timeout::timeout]
    fn offer_to_offline_user_is_dropped_silently() {
        let hub = hub();
        let mut a = hub.attach();
        let mut bystander = hub.attach();
        register(&hub, &a, "alice");
        register(&hub, &bystander, "bob");
        drain(&mut a);
        drain(&mut bystander);

        offer(&hub, &a, "alice", "zed");

        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut bystander).is_empty());
    }

    #[test_timeout::timeout]
    fn disconnect_without_leave_empties_and_deletes_room() {
        let hub = hub();
        let mut a = hub.attach();
        let b = hub.attach();
        register(&hub, &a, "alice");
        register(&hub, &b, "bob");
        join(&hub, &a, "r1", "alice");
        join(&hub, &b, "r1", "bob");
        drain(&mut a);

        hub.dispatch(
            &b.connection_id,
            ClientMessage::LeaveRoom {
                room_id: Some("r1".into()),
                user_id: Some("bob".into()),
            },
        );
        assert_eq!(drain(&mut a), vec![ServerMessage::UserDisconnected("bob".into())]);
        assert_eq!(hub.room_members("r1"), vec!["alice".to_string()]);

        hub.detach(&a.connection_id);
        assert!(hub.room_members("r1").is_empty());
        assert!(hub.status().rooms.is_empty());
    }

    #[test_timeout::timeout]
    fn implicit_leave_notifies_remaining_member() {
        let hub = hub();
        let a = hub.attach();
        let mut b = hub.attach();
        join(&hub, &a, "r1", "alice");
        join(&hub, &b, "r1", "bob");
        drain(&mut b);

        hub.detach(&a.connection_id);

        let messages = drain(&mut b);
        assert!(messages.contains(&ServerMessage::UserDisconnected("alice".into())));
        assert_eq!(hub.room_members("r1"), vec!["bob".to_string()]);
    }

    #[test_timeout::timeout]
    fn join_on_unbound_connection_registers_user() {
        let hub = hub();
        let a = hub.attach();
        join(&hub, &a, "r1", "alice");
        assert!(hub.is_online("alice"));
        assert_eq!(hub.room_members("r1"), vec!["alice".to_string()]);
    }

    #[test_timeout::timeout]
    fn join_under_another_identity_rebinds_the_connection() {
        let hub = hub();
        let mut observer = hub.attach();
        let a = hub.attach();
        let b = hub.attach();
        register(&hub, &a, "alice");
        join(&hub, &a, "r1", "mallory");
        join(&hub, &b, "r1", "bob");

        assert!(!hub.is_online("alice"));
        assert!(hub.is_online("mallory"));
        assert_eq!(
            status_changes(&drain(&mut observer)),
            vec![
                ("alice".into(), true),
                ("alice".into(), false),
                ("mallory".into(), true),
                ("bob".into(), true),
            ]
        );

        hub.detach(&a.connection_id);
        hub.detach(&b.connection_id);

        assert!(hub.room_members("r1").is_empty());
        assert!(hub.status().rooms.is_empty());
    }

    #[test_timeout::timeout]
    fn reaped_connection_cannot_register_again() {
        let hub = Hub::new(HubConfig {
            heartbeat_timeout: Duration::from_secs(10),
            ..HubConfig::default()
        });
        let quiet = hub.attach();
        register(&hub, &quiet, "erin");
        assert_eq!(hub.reap_stale_at(hub.now_millis() + 60_000), 1);

        assert!(!hub.touch(&quiet.connection_id));
        register(&hub, &quiet, "erin");
        join(&hub, &quiet, "r1", "erin");

        assert!(!hub.is_online("erin"));
        assert!(hub.connections_of("erin").is_empty());
        assert!(hub.room_members("r1").is_empty());
        assert_eq!(hub.status().registered_connections, 0);
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread")]
    async fn concurrent_joiners_race_for_the_last_seat() {
        for round in 0..50 {
            let hub = hub();
            let room = format!("r{round}");
            let host = hub.attach();
            join(&hub, &host, &room, "alice");

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let contenders = ["bob", "carol"].map(|user| {
                let hub = hub.clone();
                let barrier = barrier.clone();
                let room = room.clone();
                tokio::spawn(async move {
                    let mut attachment = hub.attach();
                    barrier.wait().await;
                    join(&hub, &attachment, &room, user);
                    drain(&mut attachment)
                })
            });

            let mut rejected = 0;
            for contender in contenders {
                let messages = contender.await.unwrap();
                if messages.contains(&ServerMessage::RoomFull(room.clone())) {
                    rejected += 1;
                }
            }
            assert_eq!(rejected, 1, "round {round}");
            let members = hub.room_members(&room);
            assert_eq!(members.len(), 2, "round {round}");
            assert_eq!(members[0], "alice");
        }
    }

    #[test_timeout::timeout]
    fn events_missing_identity_are_ignored() {
        let hub = hub();
        let mut a = hub.attach();
        hub.dispatch(&a.connection_id, ClientMessage::Register { user_id: None });
        hub.dispatch(
            &a.connection_id,
            ClientMessage::JoinRoom {
                room_id: Some("r1".into()),
                user_id: Some("".into()),
            },
        );
        hub.dispatch(
            &a.connection_id,
            ClientMessage::SendOffer {
                offer: json!({}),
                to_user_id: None,
                from_user_id: Some("alice".into()),
                room_id: None,
            },
        );

        assert!(drain(&mut a).is_empty());
        assert!(hub.online_users().is_empty());
        assert!(hub.status().rooms.is_empty());
    }

    #[test_timeout::timeout]
    fn typing_is_broadcast_to_everyone_but_the_sender() {
        let hub = hub();
        let mut a = hub.attach();
        let mut b = hub.attach();
        let mut c = hub.attach();

        hub.dispatch(
            &a.connection_id,
            ClientMessage::Typing {
                booking_id: json!("booking-3"),
            },
        );

        let expected = ServerMessage::Typing {
            booking_id: json!("booking-3"),
        };
        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![expected.clone()]);
        assert_eq!(drain(&mut c), vec![expected]);
    }

    #[test_timeout::timeout]
    fn ping_is_answered() {
        let hub = hub();
        let mut a = hub.attach();
        hub.dispatch(&a.connection_id, ClientMessage::Ping);
        assert_eq!(drain(&mut a), vec![ServerMessage::Pong]);
    }

    #[test_timeout::timeout]
    fn reaper_evicts_connection_whose_transport_died() {
        let hub = hub();
        let mut observer = hub.attach();
        let dana = hub.attach();
        register(&hub, &dana, "dana");
        drain(&mut observer);

        // writer task gone without a close event
        drop(dana);
        let reaped = hub.reap_stale();

        assert_eq!(reaped, 1);
        assert!(!hub.is_online("dana"));
        let messages = drain(&mut observer);
        assert_eq!(status_changes(&messages), vec![("dana".into(), false)]);
    }

    #[test_timeout::timeout]
    fn reaper_closes_silent_connections() {
        let hub = Hub::new(HubConfig {
            heartbeat_timeout: Duration::from_secs(10),
            ..HubConfig::default()
        });
        let mut quiet = hub.attach();
        register(&hub, &quiet, "erin");
        drain(&mut quiet);

        assert_eq!(hub.reap_stale_at(hub.now_millis()), 0);
        assert!(hub.is_online("erin"));

        let reaped = hub.reap_stale_at(hub.now_millis() + 60_000);
        assert_eq!(reaped, 1);
        assert!(!hub.is_online("erin"));
        assert!(matches!(
            quiet.receiver.try_recv(),
            Ok(Message::Close(Some(CloseFrame { code, .. }))) if code == close_code::POLICY
        ));
    }

    #[test_timeout::timeout]
    fn full_buffer_drops_frames_without_failing() {
        let hub = Hub::new(HubConfig {
            per_connection_buffer: 1,
            ..HubConfig::default()
        });
        let slow = hub.attach();
        register(&hub, &slow, "frank");
        assert!(hub.is_online("frank"));

        let delivered = hub.deliver_to(
            "frank",
            DeliveryPolicy::PickAll,
            &NamedEvent {
                event: "newNotification".into(),
                data: json!({}),
            },
        );
        assert_eq!(delivered, 0);
    }
}
