use std::time::Duration;

use metrics::gauge;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::hub::Hub;

/// Periodic reconciliation of the registry against live transport
/// connections. Catches peers that vanished without a close frame.
pub struct Reaper {
    hub: Hub,
    interval: Duration,
}

impl Reaper {
    pub fn new(hub: Hub, interval: Duration) -> Self {
        Self { hub, interval }
    }

    pub fn sweep(&self) -> usize {
        let reaped = self.hub.reap_stale();
        if reaped > 0 {
            info!(reaped, "stale connection sweep evicted connections");
        }
        reaped
    }

    /// Start the sweep loop. A zero interval disables the reaper.
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            info!("stale connection reaper disabled");
            return None;
        }

        let mut interval = tokio::time::interval(self.interval);
        Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                self.sweep();
            }
        }))
    }
}

/// Logs a summary of rooms and online users on a fixed cadence.
pub struct StatusReporter {
    hub: Hub,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(hub: Hub, interval: Duration) -> Self {
        Self { hub, interval }
    }

    pub fn report(&self) {
        let status = self.hub.status();
        gauge!("beach_classroom_rooms_active", status.rooms.len() as f64);
        gauge!(
            "beach_classroom_users_online",
            status.online_users.len() as f64
        );
        info!(
            rooms = status.rooms.len(),
            online_users = status.online_users.len(),
            connections = status.attached_connections,
            "classroom status"
        );
        for room in &status.rooms {
            debug!(room_id = %room.room_id, members = ?room.members, "active room");
        }
        debug!(online = ?status.online_users, "online users");
    }

    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            return None;
        }

        let mut interval = tokio::time::interval(self.interval);
        Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                self.report();
            }
        }))
    }
}
