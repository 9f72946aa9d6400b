//! Broadcast router: connection membership and event fan-out.
//!
//! Every connection is in at most one room, named after a session id.
//! Delivery is a non-blocking push onto the connection's bounded outbound
//! queue. A connection whose queue is full or closed is dropped from the
//! router entirely: its sender is released, so the connection task sees the
//! queue end and closes the socket. Viewers therefore never see a gap in a
//! session's output; they either keep up or get disconnected.

use ptyhub_core::ServerEvent;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Identifier of a client connection, unique for the server's lifetime.
pub type ConnId = u64;

struct Member {
    tx: mpsc::Sender<ServerEvent>,
    room: Option<String>,
}

/// Rooms keyed by session id plus per-connection outbound queues.
#[derive(Default)]
pub struct BroadcastRouter {
    members: HashMap<ConnId, Member>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. It starts detached.
    pub fn add(&mut self, conn: ConnId, tx: mpsc::Sender<ServerEvent>) {
        if let Some(old) = self.members.insert(conn, Member { tx, room: None }) {
            if let Some(room) = old.room {
                self.remove_from_room(conn, &room);
            }
        }
    }

    /// Forget a connection. Returns the room it was in.
    pub fn remove(&mut self, conn: ConnId) -> Option<String> {
        let member = self.members.remove(&conn)?;
        let room = member.room?;
        self.remove_from_room(conn, &room);
        Some(room)
    }

    #[cfg(test)]
    pub fn contains(&self, conn: ConnId) -> bool {
        self.members.contains_key(&conn)
    }

    /// Move a connection into `room`, leaving its previous room.
    ///
    /// Returns false if the connection is unknown.
    pub fn join(&mut self, conn: ConnId, room: &str) -> bool {
        let Some(member) = self.members.get_mut(&conn) else {
            return false;
        };
        let previous = member.room.replace(room.to_string());
        if let Some(previous) = previous {
            if previous != room {
                self.remove_from_room(conn, &previous);
            }
        }
        self.rooms.entry(room.to_string()).or_default().insert(conn);
        true
    }

    /// Detach a connection from its room. Returns the room it left.
    #[cfg(test)]
    pub fn leave(&mut self, conn: ConnId) -> Option<String> {
        let room = self.members.get_mut(&conn)?.room.take()?;
        self.remove_from_room(conn, &room);
        Some(room)
    }

    #[cfg(test)]
    pub fn room_of(&self, conn: ConnId) -> Option<&str> {
        self.members.get(&conn)?.room.as_deref()
    }

    /// Members of a room, sorted.
    #[cfg(test)]
    pub fn room_members(&self, room: &str) -> Vec<ConnId> {
        let mut members: Vec<ConnId> = self
            .rooms
            .get(room)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Delete a room, detaching all of its members. Returns who was detached.
    pub fn clear_room(&mut self, room: &str) -> Vec<ConnId> {
        let Some(set) = self.rooms.remove(room) else {
            return Vec::new();
        };
        let mut detached: Vec<ConnId> = set.into_iter().collect();
        detached.sort_unstable();
        for conn in &detached {
            if let Some(member) = self.members.get_mut(conn) {
                member.room = None;
            }
        }
        detached
    }

    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    /// Deliver an event to one connection. Returns whether it was queued.
    pub fn send_to(&mut self, conn: ConnId, event: ServerEvent) -> bool {
        let Some(member) = self.members.get(&conn) else {
            return false;
        };
        match member.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                self.drop_lagging(conn, e);
                false
            }
        }
    }

    /// Deliver an event to every member of `room`. Returns how many received it.
    pub fn broadcast_room(&mut self, room: &str, event: &ServerEvent) -> usize {
        let targets = match self.rooms.get(room) {
            Some(set) => set.iter().copied().collect::<Vec<_>>(),
            None => return 0,
        };
        self.deliver(targets, event)
    }

    /// Deliver an event to every connection.
    pub fn broadcast_all(&mut self, event: &ServerEvent) -> usize {
        let targets: Vec<ConnId> = self.members.keys().copied().collect();
        self.deliver(targets, event)
    }

    fn deliver(&mut self, targets: Vec<ConnId>, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in targets {
            let Some(member) = self.members.get(&conn) else {
                continue;
            };
            match member.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((conn, e)),
            }
        }
        for (conn, e) in failed {
            self.drop_lagging(conn, e);
        }
        delivered
    }

    fn drop_lagging(&mut self, conn: ConnId, error: TrySendError<ServerEvent>) {
        match error {
            TrySendError::Full(event) => warn!(
                conn_id = conn,
                event = event.name(),
                "outbound queue full, dropping connection"
            ),
            TrySendError::Closed(_) => debug!(conn_id = conn, "connection already gone"),
        }
        self.remove(conn);
    }

    fn remove_from_room(&mut self, conn: ConnId, room: &str) {
        if let Some(set) = self.rooms.get_mut(room) {
            set.remove(&conn);
            if set.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}
