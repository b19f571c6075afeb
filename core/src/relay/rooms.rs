//! Named connection groups for relay broadcasts

use crate::transport::{Socket, Value};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::trace;

/// Room membership, keyed by connection id so a reconnecting peer never
/// inherits the memberships of its previous connection
#[derive(Default)]
pub struct Rooms {
    rooms: RwLock<HashMap<String, HashMap<u64, Socket>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, room: &str, socket: &Socket) {
        self.rooms
            .write()
            .entry(room.to_string())
            .or_default()
            .insert(socket.id(), socket.clone());
    }

    /// Returns true if the connection was a member
    pub fn leave(&self, room: &str, connection_id: u64) -> bool {
        let mut rooms = self.rooms.write();
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&connection_id).is_some();
        if members.is_empty() {
            rooms.remove(room);
        }
        removed
    }

    /// Drop a connection from every room it joined
    pub fn leave_all(&self, connection_id: u64) {
        self.rooms.write().retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
    }

    /// Drop a room and all its memberships
    pub fn clear(&self, room: &str) {
        self.rooms.write().remove(room);
    }

    pub fn members(&self, room: &str) -> Vec<Socket> {
        self.rooms
            .read()
            .get(room)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room: &str, connection_id: u64) -> bool {
        self.rooms
            .read()
            .get(room)
            .map_or(false, |m| m.contains_key(&connection_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Emit to every member. Returns how many connections accepted the event.
    pub fn broadcast(&self, room: &str, event: &str, args: Vec<Value>) -> usize {
        let members = self.members(room);
        let mut delivered = 0;
        for member in members {
            if member.emit(event, args.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!("broadcast {} to {} members of {}", event, delivered, room);
        delivered
    }
}
