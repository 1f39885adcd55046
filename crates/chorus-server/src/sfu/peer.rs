//! Peer Session
//!
//! Per-connection state: which room the connection joined and as whom. What
//! the peer owns is indexed by the registries under its room and peer id, so
//! a cascade started by another peer is reflected without touching this
//! session.

use chorus_protocol::{PeerId, RoomId, RtpCapabilities};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotJoined,
    Joined,
    /// Terminal: joining again needs a new connection
    Left,
}

#[derive(Debug)]
pub struct PeerSession {
    pub connection_id: Uuid,
    state: PeerState,
    peer_id: Option<PeerId>,
    room_id: Option<RoomId>,
    rtp_capabilities: RtpCapabilities,
}

impl PeerSession {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            state: PeerState::NotJoined,
            peer_id: None,
            room_id: None,
            rtp_capabilities: RtpCapabilities::default(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    /// Capabilities declared at join, used when a consume request omits them
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    /// Whether the session is currently a member of `room_id`
    pub fn is_in(&self, room_id: &RoomId) -> bool {
        self.state == PeerState::Joined && self.room_id.as_ref() == Some(room_id)
    }

    /// Whether a resource registered to `peer_id` in `room_id` belongs to
    /// this session. Nothing is owned before join or after leave.
    pub fn owns(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        self.is_in(room_id) && self.peer_id.as_ref() == Some(peer_id)
    }

    pub fn mark_joined(
        &mut self,
        room_id: RoomId,
        peer_id: PeerId,
        rtp_capabilities: RtpCapabilities,
    ) {
        self.state = PeerState::Joined;
        self.room_id = Some(room_id);
        self.peer_id = Some(peer_id);
        self.rtp_capabilities = rtp_capabilities;
    }

    pub fn mark_left(&mut self) {
        self.state = PeerState::Left;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_and_ownership() {
        let room = RoomId::from("r1");
        let mut session = PeerSession::new(Uuid::new_v4());
        assert_eq!(session.state(), PeerState::NotJoined);
        assert!(!session.is_in(&room));
        assert!(!session.owns(&room, &PeerId::from("a")));

        session.mark_joined(room.clone(), PeerId::from("a"), RtpCapabilities::default());
        assert!(session.is_in(&room));
        assert!(session.owns(&room, &PeerId::from("a")));
        assert!(!session.owns(&room, &PeerId::from("b")));
        assert!(!session.owns(&RoomId::from("r2"), &PeerId::from("a")));

        session.mark_left();
        assert_eq!(session.state(), PeerState::Left);
        assert!(!session.is_in(&room));
        assert!(!session.owns(&room, &PeerId::from("a")));
    }
}
