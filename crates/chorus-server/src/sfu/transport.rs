//! Transport Manager
//!
//! WebRTC transports keyed by id. A transport is the root of the ownership
//! tree: closing it closes the producers publishing on it (and their
//! consumers) and the consumers delivering over it.

use super::consumer::ConsumerManager;
use super::producer::ProducerManager;
use super::{ClosedResources, PeerKey, RouterRegistry};
use crate::engine::{EngineTransport, TransportListenConfig};
use crate::error::{Result, SfuError};
use chorus_protocol::{
    DtlsParameters, PeerId, RoomId, TransportDescriptor, TransportDirection, TransportId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Closed,
}

pub struct TransportEntry {
    pub id: TransportId,
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub direction: TransportDirection,
    /// Router the transport was created on
    pub router_id: Uuid,
    pub handle: Arc<dyn EngineTransport>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
}

impl TransportEntry {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn descriptor(&self) -> TransportDescriptor {
        TransportDescriptor {
            id: self.id,
            ice_parameters: self.handle.ice_parameters(),
            ice_candidates: self.handle.ice_candidates(),
            dtls_parameters: self.handle.dtls_parameters(),
        }
    }
}

#[derive(Default)]
struct TransportIndex {
    entries: HashMap<TransportId, Arc<TransportEntry>>,
    by_peer: HashMap<PeerKey, HashSet<TransportId>>,
}

impl TransportIndex {
    fn insert(&mut self, entry: Arc<TransportEntry>) {
        self.by_peer
            .entry((entry.room_id.clone(), entry.peer_id.clone()))
            .or_default()
            .insert(entry.id);
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, transport_id: TransportId) -> Option<Arc<TransportEntry>> {
        let entry = self.entries.remove(&transport_id)?;
        let key = (entry.room_id.clone(), entry.peer_id.clone());
        if let Some(ids) = self.by_peer.get_mut(&key) {
            ids.remove(&transport_id);
            if ids.is_empty() {
                self.by_peer.remove(&key);
            }
        }
        Some(entry)
    }
}

pub struct TransportManager {
    routers: Arc<RouterRegistry>,
    producers: Arc<ProducerManager>,
    consumers: Arc<ConsumerManager>,
    listen: TransportListenConfig,
    index: RwLock<TransportIndex>,
}

impl TransportManager {
    pub fn new(
        routers: Arc<RouterRegistry>,
        producers: Arc<ProducerManager>,
        consumers: Arc<ConsumerManager>,
        listen: TransportListenConfig,
    ) -> Self {
        Self {
            routers,
            producers,
            consumers,
            listen,
            index: RwLock::new(TransportIndex::default()),
        }
    }

    /// Create a transport on the room's router, creating the router if needed
    pub async fn create(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<Arc<TransportEntry>> {
        let router = self.routers.get_or_create(room_id).await?;
        let handle = router.handle.create_webrtc_transport(&self.listen).await?;

        let entry = Arc::new(TransportEntry {
            id: handle.id(),
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
            direction,
            router_id: router.id(),
            handle,
            state: Mutex::new(ConnectionState::New),
            closed: AtomicBool::new(false),
        });

        self.index.write().await.insert(entry.clone());

        tracing::info!(
            "Created {} transport {} for peer {} in room {}",
            direction,
            entry.id,
            peer_id,
            room_id
        );

        Ok(entry)
    }

    pub async fn get(&self, transport_id: TransportId) -> Option<Arc<TransportEntry>> {
        self.index.read().await.entries.get(&transport_id).cloned()
    }

    /// Live transports of a peer
    pub async fn for_peer(&self, room_id: &RoomId, peer_id: &PeerId) -> Vec<Arc<TransportEntry>> {
        let index = self.index.read().await;
        let Some(ids) = index.by_peer.get(&(room_id.clone(), peer_id.clone())) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| index.entries.get(id).cloned())
            .collect()
    }

    /// Complete the DTLS handshake with the client's parameters
    pub async fn connect(&self, transport_id: TransportId, remote: DtlsParameters) -> Result<()> {
        let entry = self
            .get(transport_id)
            .await
            .ok_or_else(|| SfuError::not_found("transport", transport_id))?;

        if entry.state() == ConnectionState::Connected {
            return Err(SfuError::InvalidState(format!(
                "transport {} is already connected",
                transport_id
            )));
        }

        entry.handle.connect(remote).await?;
        entry.set_state(ConnectionState::Connected);

        tracing::debug!("Connected transport {}", transport_id);
        Ok(())
    }

    /// Close a transport with everything that depends on it. Unknown ids are
    /// a no-op and return an empty summary.
    pub async fn close(&self, transport_id: TransportId) -> ClosedResources {
        let Some(entry) = self.index.write().await.remove(transport_id) else {
            return ClosedResources::default();
        };

        self.teardown(entry).await
    }

    /// Close every transport created on `router_id`
    pub async fn close_for_router(&self, router_id: Uuid) -> ClosedResources {
        let removed: Vec<Arc<TransportEntry>> = {
            let mut index = self.index.write().await;
            let ids: Vec<TransportId> = index
                .entries
                .values()
                .filter(|entry| entry.router_id == router_id)
                .map(|entry| entry.id)
                .collect();
            ids.into_iter().filter_map(|id| index.remove(id)).collect()
        };

        let mut closed = ClosedResources::default();
        for entry in removed {
            closed.merge(self.teardown(entry).await);
        }
        closed
    }

    async fn teardown(&self, entry: Arc<TransportEntry>) -> ClosedResources {
        // Must be visible before the child registries are swept so that a
        // concurrent produce/consume on this transport backs out.
        entry.closed.store(true, Ordering::SeqCst);
        entry.set_state(ConnectionState::Closed);

        let mut closed = self.producers.close_for_transport(entry.id).await;
        closed
            .consumers
            .extend(self.consumers.close_for_transport(entry.id).await);

        if let Err(e) = entry.handle.close().await {
            tracing::warn!("Error closing transport {}: {}", entry.id, e);
        }

        tracing::info!(
            "Closed transport {} of peer {} ({} producers, {} consumers)",
            entry.id,
            entry.peer_id,
            closed.producers.len(),
            closed.consumers.len()
        );

        closed
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
