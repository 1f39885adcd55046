//! Consumer Manager
//!
//! Subscriptions of peers to producers. Consumers are indexed by the producer
//! they read from and the transport they send on, so either parent closing can
//! cascade to them.

use super::producer::ProducerEntry;
use super::transport::TransportEntry;
use super::{PeerKey, RouterRegistry};
use crate::engine::EngineConsumer;
use crate::error::{Result, SfuError};
use chorus_protocol::{
    ConsumerDescriptor, ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RtpCapabilities,
    TransportDirection, TransportId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub handle: Arc<dyn EngineConsumer>,
    paused: AtomicBool,
}

impl ConsumerEntry {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn descriptor(&self) -> ConsumerDescriptor {
        ConsumerDescriptor {
            id: self.id,
            producer_id: self.producer_id,
            kind: self.kind,
            rtp_parameters: self.handle.rtp_parameters(),
            paused: self.is_paused(),
        }
    }
}

#[derive(Default)]
struct ConsumerIndex {
    entries: HashMap<ConsumerId, Arc<ConsumerEntry>>,
    by_producer: HashMap<ProducerId, HashSet<ConsumerId>>,
    by_transport: HashMap<TransportId, HashSet<ConsumerId>>,
    by_peer: HashMap<PeerKey, HashSet<ConsumerId>>,
}

impl ConsumerIndex {
    fn insert(&mut self, entry: Arc<ConsumerEntry>) {
        self.by_producer
            .entry(entry.producer_id)
            .or_default()
            .insert(entry.id);
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

    fn remove(&mut self, consumer_id: ConsumerId) -> Option<Arc<ConsumerEntry>> {
        let entry = self.entries.remove(&consumer_id)?;

        if let Some(ids) = self.by_producer.get_mut(&entry.producer_id) {
            ids.remove(&consumer_id);
            if ids.is_empty() {
                self.by_producer.remove(&entry.producer_id);
            }
        }
        if let Some(ids) = self.by_transport.get_mut(&entry.transport_id) {
            ids.remove(&consumer_id);
            if ids.is_empty() {
                self.by_transport.remove(&entry.transport_id);
            }
        }
        let key = (entry.room_id.clone(), entry.peer_id.clone());
        if let Some(ids) = self.by_peer.get_mut(&key) {
            ids.remove(&consumer_id);
            if ids.is_empty() {
                self.by_peer.remove(&key);
            }
        }

        Some(entry)
    }
}

pub struct ConsumerManager {
    routers: Arc<RouterRegistry>,
    index: RwLock<ConsumerIndex>,
}

impl ConsumerManager {
    pub fn new(routers: Arc<RouterRegistry>) -> Self {
        Self {
            routers,
            index: RwLock::new(ConsumerIndex::default()),
        }
    }

    /// Subscribe `peer_id` to `producer` over `transport`.
    ///
    /// The consumer starts paused so no media flows before the subscriber has
    /// registered it. If the producer or transport closes while the engine
    /// call is in flight the new consumer is closed again and `NotFound` is
    /// returned.
    pub async fn create(
        &self,
        room_id: &RoomId,
        transport: &TransportEntry,
        producer: &ProducerEntry,
        capabilities: &RtpCapabilities,
        peer_id: &PeerId,
    ) -> Result<ConsumerDescriptor> {
        let router = self
            .routers
            .get(room_id)
            .await
            .ok_or_else(|| SfuError::not_found("room", room_id))?;

        if transport.room_id != *room_id {
            return Err(SfuError::not_found("transport", transport.id));
        }
        if producer.room_id != *room_id {
            return Err(SfuError::not_found("producer", producer.id));
        }
        if transport.direction != TransportDirection::Receive {
            return Err(SfuError::InvalidRequest(format!(
                "transport {} is not a receive transport",
                transport.id
            )));
        }

        if !router
            .handle
            .can_consume(&producer.handle.rtp_parameters(), capabilities)
        {
            return Err(SfuError::IncompatibleCapabilities(producer.id));
        }

        let handle = match transport.handle.consume(producer.id, capabilities, true).await {
            Ok(handle) => handle,
            Err(e) => {
                return Err(Self::closed_parent(transport, producer).unwrap_or_else(|| e.into()));
            }
        };

        let entry = Arc::new(ConsumerEntry {
            id: handle.id(),
            room_id: room_id.clone(),
            transport_id: transport.id,
            producer_id: producer.id,
            peer_id: peer_id.clone(),
            kind: handle.kind(),
            paused: AtomicBool::new(handle.paused()),
            handle,
        });

        {
            let mut index = self.index.write().await;
            // Parents mark themselves closed before cascading into this
            // index, so checking under the lock cannot miss a cascade.
            if !producer.is_closed() && !transport.is_closed() {
                index.insert(entry.clone());
                drop(index);

                tracing::info!(
                    "Created consumer {} for producer {} (peer {}, room {})",
                    entry.id,
                    producer.id,
                    peer_id,
                    room_id
                );
                return Ok(entry.descriptor());
            }
        }

        if let Err(e) = entry.handle.close().await {
            tracing::warn!("Error closing abandoned consumer {}: {}", entry.id, e);
        }
        Err(Self::closed_parent(transport, producer)
            .unwrap_or_else(|| SfuError::not_found("producer", producer.id)))
    }

    /// `NotFound` for whichever parent closed under a create
    fn closed_parent(transport: &TransportEntry, producer: &ProducerEntry) -> Option<SfuError> {
        if transport.is_closed() {
            Some(SfuError::not_found("transport", transport.id))
        } else if producer.is_closed() {
            Some(SfuError::not_found("producer", producer.id))
        } else {
            None
        }
    }

    pub async fn get(&self, consumer_id: ConsumerId) -> Option<Arc<ConsumerEntry>> {
        self.index.read().await.entries.get(&consumer_id).cloned()
    }

    /// Live consumers of a peer
    pub async fn for_peer(&self, room_id: &RoomId, peer_id: &PeerId) -> Vec<Arc<ConsumerEntry>> {
        let index = self.index.read().await;
        let Some(ids) = index.by_peer.get(&(room_id.clone(), peer_id.clone())) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| index.entries.get(id).cloned())
            .collect()
    }

    pub async fn resume(&self, consumer_id: ConsumerId) -> Result<()> {
        let entry = self
            .get(consumer_id)
            .await
            .ok_or_else(|| SfuError::not_found("consumer", consumer_id))?;

        entry.handle.resume().await?;
        entry.paused.store(false, Ordering::SeqCst);

        tracing::debug!("Resumed consumer {}", consumer_id);
        Ok(())
    }

    pub async fn pause(&self, consumer_id: ConsumerId) -> Result<()> {
        let entry = self
            .get(consumer_id)
            .await
            .ok_or_else(|| SfuError::not_found("consumer", consumer_id))?;

        entry.handle.pause().await?;
        entry.paused.store(true, Ordering::SeqCst);

        tracing::debug!("Paused consumer {}", consumer_id);
        Ok(())
    }

    /// Close a consumer. Unknown ids are a no-op.
    pub async fn close(&self, consumer_id: ConsumerId) -> Option<Arc<ConsumerEntry>> {
        let entry = self.index.write().await.remove(consumer_id)?;
        Self::close_handle(&entry).await;
        Some(entry)
    }

    /// Close every consumer reading from `producer_id`
    pub async fn close_for_producer(&self, producer_id: ProducerId) -> Vec<Arc<ConsumerEntry>> {
        let removed: Vec<Arc<ConsumerEntry>> = {
            let mut index = self.index.write().await;
            let ids = index.by_producer.remove(&producer_id).unwrap_or_default();
            ids.into_iter().filter_map(|id| index.remove(id)).collect()
        };

        for entry in &removed {
            Self::close_handle(entry).await;
        }
        removed
    }

    /// Close every consumer sending on `transport_id`
    pub async fn close_for_transport(&self, transport_id: TransportId) -> Vec<Arc<ConsumerEntry>> {
        let removed: Vec<Arc<ConsumerEntry>> = {
            let mut index = self.index.write().await;
            let ids = index.by_transport.remove(&transport_id).unwrap_or_default();
            ids.into_iter().filter_map(|id| index.remove(id)).collect()
        };

        for entry in &removed {
            Self::close_handle(entry).await;
        }
        removed
    }

    async fn close_handle(entry: &ConsumerEntry) {
        if let Err(e) = entry.handle.close().await {
            tracing::warn!("Error closing consumer {}: {}", entry.id, e);
        }
        tracing::debug!("Closed consumer {} of peer {}", entry.id, entry.peer_id);
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
