//! Producer Manager
//!
//! Media sources published by peers. Closing a producer takes every consumer
//! of it down too.

use super::{ClosedResources, PeerKey};
use super::consumer::ConsumerManager;
use super::transport::TransportEntry;
use crate::engine::EngineProducer;
use crate::error::{Result, SfuError};
use chorus_protocol::{
    MediaKind, PeerId, ProducerId, ProducerInfo, RoomId, RtpParameters, TransportDirection,
    TransportId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

pub struct ProducerEntry {
    pub id: ProducerId,
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub handle: Arc<dyn EngineProducer>,
    closed: AtomicBool,
}

impl ProducerEntry {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            peer_id: self.peer_id.clone(),
            producer_id: self.id,
            kind: self.kind,
        }
    }
}

#[derive(Default)]
struct ProducerIndex {
    entries: HashMap<ProducerId, Arc<ProducerEntry>>,
    by_transport: HashMap<TransportId, HashSet<ProducerId>>,
    by_peer: HashMap<PeerKey, HashSet<ProducerId>>,
}

impl ProducerIndex {
    fn insert(&mut self, entry: Arc<ProducerEntry>) {
        self.by_transport
            .entry(entry.transport_id)
            .or_default()
            .insert(entry.id);
        self.by_peer
            .entry((entry.room_id.clone(), entry.peer_id.clone()))
            .or_default()
            .insert(entry.id);
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, producer_id: ProducerId) -> Option<Arc<ProducerEntry>> {
        let entry = self.entries.remove(&producer_id)?;
        if let Some(ids) = self.by_transport.get_mut(&entry.transport_id) {
            ids.remove(&producer_id);
            if ids.is_empty() {
                self.by_transport.remove(&entry.transport_id);
            }
        }
        let key = (entry.room_id.clone(), entry.peer_id.clone());
        if let Some(ids) = self.by_peer.get_mut(&key) {
            ids.remove(&producer_id);
            if ids.is_empty() {
                self.by_peer.remove(&key);
            }
        }
        Some(entry)
    }
}

pub struct ProducerManager {
    consumers: Arc<ConsumerManager>,
    index: RwLock<ProducerIndex>,
}

impl ProducerManager {
    pub fn new(consumers: Arc<ConsumerManager>) -> Self {
        Self {
            consumers,
            index: RwLock::new(ProducerIndex::default()),
        }
    }

    /// Start receiving media from `peer_id` on a send transport
    pub async fn create(
        &self,
        transport: &TransportEntry,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        peer_id: &PeerId,
    ) -> Result<Arc<ProducerEntry>> {
        if transport.direction != TransportDirection::Send {
            return Err(SfuError::InvalidRequest(format!(
                "transport {} is not a send transport",
                transport.id
            )));
        }

        let handle = match transport.handle.produce(kind, rtp_parameters).await {
            Ok(handle) => handle,
            Err(_) if transport.is_closed() => {
                return Err(SfuError::not_found("transport", transport.id));
            }
            Err(e) => return Err(e.into()),
        };

        let entry = Arc::new(ProducerEntry {
            id: handle.id(),
            room_id: transport.room_id.clone(),
            transport_id: transport.id,
            peer_id: peer_id.clone(),
            kind: handle.kind(),
            handle,
            closed: AtomicBool::new(false),
        });

        {
            let mut index = self.index.write().await;
            // Checked under the index lock: a transport teardown marks itself
            // closed before sweeping this index.
            if !transport.is_closed() {
                index.insert(entry.clone());
                drop(index);

                tracing::info!(
                    "Created {} producer {} for peer {} in room {}",
                    entry.kind,
                    entry.id,
                    peer_id,
                    entry.room_id
                );
                return Ok(entry);
            }
        }

        if let Err(e) = entry.handle.close().await {
            tracing::warn!("Error closing abandoned producer {}: {}", entry.id, e);
        }
        Err(SfuError::not_found("transport", transport.id))
    }

    pub async fn get(&self, producer_id: ProducerId) -> Option<Arc<ProducerEntry>> {
        self.index.read().await.entries.get(&producer_id).cloned()
    }

    /// Close a producer and all of its consumers. Unknown ids are a no-op.
    pub async fn close(&self, producer_id: ProducerId) -> ClosedResources {
        let mut closed = ClosedResources::default();

        let producer = {
            let mut index = self.index.write().await;
            let Some(entry) = index.remove(producer_id) else {
                return closed;
            };
            entry.closed.store(true, Ordering::SeqCst);
            entry
        };

        self.finish_close(producer, &mut closed).await;
        closed
    }

    /// Close every producer publishing on `transport_id`
    pub async fn close_for_transport(&self, transport_id: TransportId) -> ClosedResources {
        let removed: Vec<Arc<ProducerEntry>> = {
            let mut index = self.index.write().await;
            let ids = index.by_transport.remove(&transport_id).unwrap_or_default();
            ids.into_iter()
                .filter_map(|id| index.remove(id))
                .inspect(|entry| entry.closed.store(true, Ordering::SeqCst))
                .collect()
        };

        let mut closed = ClosedResources::default();
        for producer in removed {
            self.finish_close(producer, &mut closed).await;
        }
        closed
    }

    async fn finish_close(&self, producer: Arc<ProducerEntry>, closed: &mut ClosedResources) {
        let consumers = self.consumers.close_for_producer(producer.id).await;

        if let Err(e) = producer.handle.close().await {
            tracing::warn!("Error closing producer {}: {}", producer.id, e);
        }

        tracing::info!(
            "Closed producer {} of peer {} ({} consumers)",
            producer.id,
            producer.peer_id,
            consumers.len()
        );

        closed.consumers.extend(consumers);
        closed.producers.push(producer);
    }

    /// Live producers of a peer
    pub async fn for_peer(&self, room_id: &RoomId, peer_id: &PeerId) -> Vec<Arc<ProducerEntry>> {
        let index = self.index.read().await;
        let Some(ids) = index.by_peer.get(&(room_id.clone(), peer_id.clone())) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| index.entries.get(id).cloned())
            .collect()
    }

    /// Every live producer in a room
    pub async fn for_room(&self, room_id: &RoomId) -> Vec<ProducerInfo> {
        self.index
            .read()
            .await
            .entries
            .values()
            .filter(|entry| entry.room_id == *room_id)
            .map(|entry| entry.info())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
