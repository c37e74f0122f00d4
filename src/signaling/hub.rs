// Room membership for signaling connections
//
// The hub knows which connections are in which room so that events can be
// fanned out. Capacity is enforced here.

use std::collections::HashMap;

use dashmap::DashMap;

use super::{Channel, ConnectionId, Event, Outbox};
use crate::{media::RoomId, Result, SfuError};

/// Default number of connections per room
pub const MAX_ROOM_CAPACITY: usize = 100;

/// Connections per room
pub struct RoomHub {
    rooms: DashMap<RoomId, HashMap<ConnectionId, Outbox>>,
    capacity: usize,
}

impl RoomHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity,
        }
    }

    /// Add a connection to a room; joining twice is a no-op.
    ///
    /// Returns whether the connection is new to the room.
    pub fn join(&self, room_id: &str, outbox: &Outbox) -> Result<bool> {
        let mut members = self.rooms.entry(room_id.to_string()).or_default();
        if members.contains_key(&outbox.connection_id()) {
            return Ok(false);
        }
        if members.len() >= self.capacity {
            return Err(SfuError::RoomFull(room_id.to_string()));
        }
        members.insert(outbox.connection_id(), outbox.clone());
        tracing::debug!(
            room_id = %room_id,
            connection_id = outbox.connection_id(),
            members = members.len(),
            "Joined room"
        );
        Ok(true)
    }

    /// Remove a connection; returns whether the room became empty
    pub fn leave(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        let now_empty = match self.rooms.get_mut(room_id) {
            Some(mut members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => return false,
        };
        if now_empty {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }
        now_empty
    }

    pub fn is_member(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(room_id)
            .map(|members| members.contains_key(&connection_id))
            .unwrap_or(false)
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|members| members.len()).unwrap_or(0)
    }

    /// Send `event` to the room's members, skipping `except` and, when
    /// `channel` is given, members of other surfaces
    pub fn broadcast(
        &self,
        room_id: &str,
        event: &Event,
        except: Option<ConnectionId>,
        channel: Option<Channel>,
    ) -> usize {
        let targets: Vec<Outbox> = match self.rooms.get(room_id) {
            Some(members) => members
                .values()
                .filter(|outbox| Some(outbox.connection_id()) != except)
                .filter(|outbox| channel.map(|c| c == outbox.channel()).unwrap_or(true))
                .cloned()
                .collect(),
            None => return 0,
        };
        for outbox in &targets {
            outbox.notify(event.clone());
        }
        targets.len()
    }

    /// Notify every member with `event` and drop the room
    pub fn close_room(&self, room_id: &str, event: &Event) -> Vec<ConnectionId> {
        let Some((_, members)) = self.rooms.remove(room_id) else {
            return Vec::new();
        };
        members
            .into_iter()
            .map(|(connection_id, outbox)| {
                outbox.notify(event.clone());
                connection_id
            })
            .collect()
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(MAX_ROOM_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::signaling::{next_connection_id, Outbound};

    fn member(channel: Channel) -> (Outbox, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (Outbox::new(next_connection_id(), channel, tx), rx)
    }

    #[test]
    fn capacity_is_enforced() {
        let hub = RoomHub::new(2);
        let (a, _ra) = member(Channel::Streaming);
        let (b, _rb) = member(Channel::Streaming);
        let (c, _rc) = member(Channel::Streaming);

        assert!(hub.join("r1", &a).unwrap());
        assert!(!hub.join("r1", &a).unwrap());
        assert!(hub.join("r1", &b).unwrap());
        assert!(matches!(hub.join("r1", &c), Err(SfuError::RoomFull(_))));

        assert!(!hub.leave("r1", a.connection_id()));
        assert!(hub.leave("r1", b.connection_id()));
        assert_eq!(hub.member_count("r1"), 0);
    }

    #[test]
    fn broadcast_filters_sender_and_channel() {
        let hub = RoomHub::default();
        let (a, mut ra) = member(Channel::Streaming);
        let (b, mut rb) = member(Channel::Streaming);
        let (c, mut rc) = member(Channel::Interactive);
        for outbox in [&a, &b, &c] {
            hub.join("r1", outbox).unwrap();
        }

        let event = Event::NewRoomAvailable {
            room_id: "r1".to_string(),
        };
        assert_eq!(hub.broadcast("r1", &event, Some(a.connection_id()), None), 2);
        assert!(ra.try_recv().is_err());
        assert_eq!(rb.try_recv().unwrap().event, event);
        assert_eq!(rc.try_recv().unwrap().event, event);

        assert_eq!(hub.broadcast("r1", &event, None, Some(Channel::Interactive)), 1);
        assert!(rb.try_recv().is_err());
        assert_eq!(rc.try_recv().unwrap().event, event);
    }

    #[test]
    fn stalled_viewer_is_marked_lagged_instead_of_missing_stop() {
        let hub = RoomHub::default();
        let (tx, mut rx) = mpsc::channel(4);
        let viewer = Outbox::new(next_connection_id(), Channel::Streaming, tx);
        hub.join("r1", &viewer).unwrap();
        for viewers in 0..4 {
            hub.broadcast("r1", &Event::ViewerCount { viewers }, None, None);
        }
        assert!(!viewer.has_lagged());

        let stopped = Event::LivestreamStopped {
            producer_ids: vec!["p1".to_string()],
        };
        assert_eq!(hub.broadcast("r1", &stopped, None, None), 1);
        assert!(viewer.has_lagged());
        while let Ok(outbound) = rx.try_recv() {
            assert_ne!(outbound.event, stopped);
        }
    }
}
