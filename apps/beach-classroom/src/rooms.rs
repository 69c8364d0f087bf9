use std::collections::BTreeMap;

use crate::protocol::{RoomId, UserId};

/// Call rooms pair one tutor with one student.
pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room did not exist; the requester is its only member.
    Created,
    /// Requester was already a member. Nothing changed.
    Rejoined { others: Vec<UserId> },
    /// Requester took a free slot; `others` were members before.
    Joined { others: Vec<UserId> },
    /// Room is at capacity. Nothing changed.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub remaining: Vec<UserId>,
    pub closed: bool,
}

/// Room membership. A room exists only while it has members.
#[derive(Debug, Default)]
pub struct RoomCoordinator {
    rooms: BTreeMap<RoomId, Vec<UserId>>,
}

impl RoomCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, room_id: &str, user_id: &str) -> JoinOutcome {
        let Some(members) = self.rooms.get_mut(room_id) else {
            self.rooms
                .insert(room_id.to_string(), vec![user_id.to_string()]);
            return JoinOutcome::Created;
        };

        if members.iter().any(|member| member == user_id) {
            return JoinOutcome::Rejoined {
                others: others_of(members, user_id),
            };
        }

        if members.len() >= ROOM_CAPACITY {
            return JoinOutcome::Full;
        }

        let others = members.clone();
        members.push(user_id.to_string());
        JoinOutcome::Joined { others }
    }

    /// Remove `user_id` from `room_id`. `None` when the user was not a member.
    pub fn leave(&mut self, room_id: &str, user_id: &str) -> Option<LeaveOutcome> {
        let members = self.rooms.get_mut(room_id)?;
        let before = members.len();
        members.retain(|member| member != user_id);
        if members.len() == before {
            return None;
        }

        let remaining = members.clone();
        let closed = remaining.is_empty();
        if closed {
            self.rooms.remove(room_id);
        }

        Some(LeaveOutcome {
            room_id: room_id.to_string(),
            remaining,
            closed,
        })
    }

    /// Remove `user_id` from every room that lists it.
    pub fn leave_all(&mut self, user_id: &str) -> Vec<LeaveOutcome> {
        let joined: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, members)| members.iter().any(|member| member == user_id))
            .map(|(room_id, _)| room_id.clone())
            .collect();

        joined
            .iter()
            .filter_map(|room_id| self.leave(room_id, user_id))
            .collect()
    }

    pub fn members(&self, room_id: &str) -> &[UserId] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RoomId, &[UserId])> {
        self.rooms
            .iter()
            .map(|(room_id, members)| (room_id, members.as_slice()))
    }
}

fn others_of(members: &[UserId], user_id: &str) -> Vec<UserId> {
    members
        .iter()
        .filter(|member| *member != user_id)
        .cloned()
        .collect()
}
