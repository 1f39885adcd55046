//! SFU orchestration
//!
//! Worker pool, per-room routers, the transport/producer/consumer registries
//! and the room manager that ties them to peer sessions.

mod consumer;
mod peer;
mod producer;
mod room;
mod router;
#[cfg(test)]
mod test_support;
mod transport;
mod worker_pool;

pub use consumer::{ConsumerEntry, ConsumerManager};
pub use peer::{PeerSession, PeerState};
pub use producer::{ProducerEntry, ProducerManager};
pub use room::RoomManager;
pub use router::{RouterEntry, RouterRegistry};
pub use transport::{ConnectionState, TransportEntry, TransportManager};
pub use worker_pool::WorkerPool;

use chorus_protocol::{PeerId, RoomId};
use std::sync::Arc;

/// Key of the per-peer ownership indexes. Peer ids are unique within a room.
type PeerKey = (RoomId, PeerId);

/// Everything a close operation took down with it
#[derive(Default)]
pub struct ClosedResources {
    pub producers: Vec<Arc<ProducerEntry>>,
    pub consumers: Vec<Arc<ConsumerEntry>>,
}

impl ClosedResources {
    pub fn merge(&mut self, other: ClosedResources) {
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
    }
}
