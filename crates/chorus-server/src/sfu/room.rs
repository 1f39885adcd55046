//! Room Manager
//!
//! Room membership and the join/leave protocol. Every operation that changes
//! what exists in a room (join, leave, produce, close, reconciliation after a
//! worker crash) runs under that room's lock, and the events it causes are
//! queued to recipients before the lock is released. Peers therefore observe
//! each room's events in one consistent order.

use super::{
    ClosedResources, ConsumerEntry, ConsumerManager, PeerSession, PeerState, ProducerEntry,
    ProducerManager, RouterEntry, RouterRegistry, TransportEntry, TransportManager, WorkerPool,
};
use crate::engine::{TransportListenConfig, WorkerId};
use crate::error::{Result, SfuError};
use crate::services::SessionRecordNotifier;
use crate::ws::connections::ConnectionManager;
use chorus_protocol::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, JoinResponse, MediaKind, PeerId, ProducerId,
    RoomId, RtpCapabilities, RtpCodecCapability, RtpParameters, ServerMessage,
    TransportDescriptor, TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};

struct Room {
    id: RoomId,
    /// Members in join order
    peers: Vec<PeerId>,
    router: Option<Arc<RouterEntry>>,
    /// Set once the last member left; a joiner holding a stale handle retries
    closed: bool,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            peers: Vec::new(),
            router: None,
            closed: false,
        }
    }

    fn others(&self, peer_id: &PeerId) -> Vec<PeerId> {
        self.peers.iter().filter(|p| *p != peer_id).cloned().collect()
    }
}

type RoomHandle = Arc<Mutex<Room>>;

pub struct RoomManager {
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
    routers: Arc<RouterRegistry>,
    transports: Arc<TransportManager>,
    producers: Arc<ProducerManager>,
    consumers: Arc<ConsumerManager>,
    connections: Arc<ConnectionManager>,
    session_records: SessionRecordNotifier,
}

impl RoomManager {
    /// Build the registries on top of `pool` and start watching it for
    /// crashed workers.
    pub fn new(
        pool: Arc<WorkerPool>,
        listen: TransportListenConfig,
        connections: Arc<ConnectionManager>,
        session_records: SessionRecordNotifier,
    ) -> Arc<Self> {
        let lost = pool.subscribe_lost();

        let routers = Arc::new(RouterRegistry::new(pool, vec![RtpCodecCapability::opus()]));
        let consumers = Arc::new(ConsumerManager::new(routers.clone()));
        let producers = Arc::new(ProducerManager::new(consumers.clone()));
        let transports = Arc::new(TransportManager::new(
            routers.clone(),
            producers.clone(),
            consumers.clone(),
            listen,
        ));

        let manager = Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            routers,
            transports,
            producers,
            consumers,
            connections,
            session_records,
        });

        tokio::spawn(Self::watch_workers(Arc::downgrade(&manager), lost));
        manager
    }

    async fn watch_workers(manager: Weak<Self>, mut lost: broadcast::Receiver<WorkerId>) {
        loop {
            match lost.recv().await {
                Ok(worker_id) => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.reconcile_lost_worker(worker_id).await;
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::error!("Missed {} worker loss notifications", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn room_handle(&self, room_id: &RoomId) -> RoomHandle {
        self.rooms
            .lock()
            .await
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room_id.clone()))))
            .clone()
    }

    async fn existing_room(&self, room_id: &RoomId) -> Result<RoomHandle> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| SfuError::not_found("room", room_id))
    }

    /// The room and peer id of a joined session
    fn membership(session: &PeerSession) -> Result<(RoomId, PeerId)> {
        match (session.state(), session.room_id(), session.peer_id()) {
            (PeerState::Joined, Some(room_id), Some(peer_id)) => {
                Ok((room_id.clone(), peer_id.clone()))
            }
            _ => Err(SfuError::InvalidState("peer has not joined a room".to_string())),
        }
    }

    pub async fn join(
        &self,
        session: &mut PeerSession,
        room_id: RoomId,
        peer_id: PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<JoinResponse> {
        if session.state() != PeerState::NotJoined {
            return Err(SfuError::InvalidState(format!(
                "connection already joined as {}",
                session.peer_id().map(PeerId::as_str).unwrap_or("?")
            )));
        }

        loop {
            let handle = self.room_handle(&room_id).await;
            let mut room = handle.lock().await;
            if room.closed {
                continue;
            }

            let result = self
                .join_locked(&mut room, session, &peer_id, rtp_capabilities.clone())
                .await;

            if let Err(e) = &result {
                tracing::warn!("Peer {} failed to join room {}: {}", peer_id, room_id, e);
                if room.peers.is_empty() {
                    self.destroy_room(&handle, &mut room).await;
                }
            }
            return result;
        }
    }

    async fn join_locked(
        &self,
        room: &mut Room,
        session: &mut PeerSession,
        peer_id: &PeerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<JoinResponse> {
        if room.peers.contains(peer_id) {
            return Err(SfuError::PeerIdTaken(peer_id.clone()));
        }

        let router = self.routers.get_or_create(&room.id).await?;
        room.router = Some(router.clone());

        let send = self
            .transports
            .create(&room.id, peer_id, TransportDirection::Send)
            .await?;
        let receive = match self
            .transports
            .create(&room.id, peer_id, TransportDirection::Receive)
            .await
        {
            Ok(receive) => receive,
            Err(e) => {
                self.transports.close(send.id).await;
                return Err(e);
            }
        };

        let peers = room.peers.clone();
        let producers = self.producers.for_room(&room.id).await;

        session.mark_joined(room.id.clone(), peer_id.clone(), rtp_capabilities);
        room.peers.push(peer_id.clone());

        self.connections
            .register_peer(&room.id, peer_id, session.connection_id)
            .await;
        self.session_records.increment(&room.id);
        self.connections
            .broadcast_to_peers(
                &room.id,
                &peers,
                &ServerMessage::NewPeer {
                    peer_id: peer_id.clone(),
                },
            )
            .await;

        tracing::info!(
            "Peer {} joined room {} ({} peers)",
            peer_id,
            room.id,
            room.peers.len()
        );

        Ok(JoinResponse {
            send_transport: send.descriptor(),
            receive_transport: receive.descriptor(),
            peers,
            router_rtp_capabilities: router.handle.rtp_capabilities(),
            producers,
        })
    }

    pub async fn leave(&self, session: &mut PeerSession, room_id: &RoomId) -> Result<()> {
        if !session.is_in(room_id) {
            return Err(SfuError::not_found("room", room_id));
        }
        let (_, peer_id) = Self::membership(session)?;

        match self.existing_room(room_id).await {
            Ok(handle) => {
                let mut room = handle.lock().await;
                self.leave_locked(&handle, &mut room, &peer_id).await;
            }
            Err(_) => {
                tracing::warn!("Room {} vanished before peer {} left", room_id, peer_id);
                self.release_resources(room_id, &peer_id).await;
                self.connections.unregister_peer(room_id, &peer_id).await;
            }
        }

        session.mark_left();
        self.session_records.decrement(room_id);

        tracing::info!("Peer {} left room {}", peer_id, room_id);
        Ok(())
    }

    /// Tear down whatever the connection still holds. Same path as an
    /// explicit leave.
    pub async fn disconnect(&self, session: &mut PeerSession) {
        let Ok((room_id, _)) = Self::membership(session) else {
            return;
        };

        if let Err(e) = self.leave(session, &room_id).await {
            tracing::warn!(
                "Cleanup of connection {} failed: {}",
                session.connection_id,
                e
            );
        }
    }

    async fn leave_locked(&self, handle: &RoomHandle, room: &mut Room, peer_id: &PeerId) {
        let closed = self.release_resources(&room.id, peer_id).await;

        room.peers.retain(|p| p != peer_id);
        self.connections.unregister_peer(&room.id, peer_id).await;
        self.announce_closed(room, &closed, Some(peer_id)).await;

        if room.peers.is_empty() {
            self.destroy_room(handle, room).await;
        } else {
            self.connections
                .broadcast_to_peers(
                    &room.id,
                    &room.peers,
                    &ServerMessage::PeerLeft {
                        peer_id: peer_id.clone(),
                    },
                )
                .await;
        }
    }

    /// Close producers, then consumers, then transports of a peer
    async fn release_resources(&self, room_id: &RoomId, peer_id: &PeerId) -> ClosedResources {
        let mut closed = ClosedResources::default();

        for producer in self.producers.for_peer(room_id, peer_id).await {
            closed.merge(self.producers.close(producer.id).await);
        }
        for consumer in self.consumers.for_peer(room_id, peer_id).await {
            if let Some(consumer) = self.consumers.close(consumer.id).await {
                closed.consumers.push(consumer);
            }
        }
        for transport in self.transports.for_peer(room_id, peer_id).await {
            closed.merge(self.transports.close(transport.id).await);
        }

        closed
    }

    async fn destroy_room(&self, handle: &RoomHandle, room: &mut Room) {
        room.closed = true;
        if let Some(router) = room.router.take() {
            tracing::debug!("Releasing router {} of room {}", router.id(), room.id);
        }
        self.routers.close(&room.id).await;

        let mut rooms = self.rooms.lock().await;
        if rooms
            .get(&room.id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            rooms.remove(&room.id);
        }

        tracing::info!("Room {} closed", room.id);
    }

    /// Tell the room about producers that went away and each subscriber about
    /// its consumers that went with them. The peer that caused the close is
    /// not told about it.
    async fn announce_closed(&self, room: &Room, closed: &ClosedResources, actor: Option<&PeerId>) {
        let recipients: Vec<PeerId> = room
            .peers
            .iter()
            .filter(|p| Some(*p) != actor)
            .cloned()
            .collect();

        for producer in &closed.producers {
            self.connections
                .broadcast_to_peers(
                    &room.id,
                    &recipients,
                    &ServerMessage::ProducerClosed {
                        peer_id: producer.peer_id.clone(),
                        producer_id: producer.id,
                    },
                )
                .await;
        }

        for consumer in &closed.consumers {
            if Some(&consumer.peer_id) == actor {
                continue;
            }
            self.connections
                .send_to_peer(
                    &room.id,
                    &consumer.peer_id,
                    &ServerMessage::ConsumerClosed {
                        consumer_id: consumer.id,
                        producer_id: consumer.producer_id,
                    },
                )
                .await;
        }
    }

    async fn owned_transport(
        &self,
        session: &PeerSession,
        transport_id: TransportId,
    ) -> Result<Arc<TransportEntry>> {
        self.transports
            .get(transport_id)
            .await
            .filter(|entry| session.owns(&entry.room_id, &entry.peer_id))
            .ok_or_else(|| SfuError::not_found("transport", transport_id))
    }

    async fn owned_producer(
        &self,
        session: &PeerSession,
        producer_id: ProducerId,
    ) -> Option<Arc<ProducerEntry>> {
        self.producers
            .get(producer_id)
            .await
            .filter(|entry| session.owns(&entry.room_id, &entry.peer_id))
    }

    async fn owned_consumer(
        &self,
        session: &PeerSession,
        consumer_id: ConsumerId,
    ) -> Result<Arc<ConsumerEntry>> {
        self.consumers
            .get(consumer_id)
            .await
            .filter(|entry| session.owns(&entry.room_id, &entry.peer_id))
            .ok_or_else(|| SfuError::not_found("consumer", consumer_id))
    }

    /// Open a further transport. A peer holds at most one live transport per
    /// direction; after a `routerReset` the old ones are gone and new ones can
    /// be created.
    pub async fn create_transport(
        &self,
        session: &PeerSession,
        room_id: &RoomId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        let (_, peer_id) = Self::membership(session)?;
        if !session.is_in(room_id) {
            return Err(SfuError::not_found("room", room_id));
        }

        let handle = self.existing_room(room_id).await?;
        let mut room = handle.lock().await;
        if room.closed {
            return Err(SfuError::not_found("room", room_id));
        }

        let existing = self.transports.for_peer(room_id, &peer_id).await;
        if let Some(current) = existing.iter().find(|t| t.direction == direction) {
            return Err(SfuError::InvalidState(format!(
                "peer {} already has {} transport {}",
                peer_id, direction, current.id
            )));
        }

        let transport = self.transports.create(room_id, &peer_id, direction).await?;
        room.router = self.routers.get(room_id).await;

        Ok(transport.descriptor())
    }

    pub async fn connect_transport(
        &self,
        session: &PeerSession,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        self.owned_transport(session, transport_id).await?;
        self.transports.connect(transport_id, dtls_parameters).await
    }

    pub async fn produce(
        &self,
        session: &PeerSession,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let (room_id, peer_id) = Self::membership(session)?;
        let transport = self.owned_transport(session, transport_id).await?;

        let handle = self.existing_room(&room_id).await?;
        let room = handle.lock().await;

        let producer = self
            .producers
            .create(&transport, kind, rtp_parameters, &peer_id)
            .await?;

        self.connections
            .broadcast_to_peers(
                &room.id,
                &room.others(&peer_id),
                &ServerMessage::NewProducer {
                    peer_id: peer_id.clone(),
                    producer_id: producer.id,
                    kind: producer.kind,
                },
            )
            .await;

        Ok(producer.id)
    }

    /// Subscribe to a producer. Empty `rtp_capabilities` fall back to the
    /// ones declared at join.
    pub async fn consume(
        &self,
        session: &PeerSession,
        room_id: &RoomId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        let (_, peer_id) = Self::membership(session)?;
        if !session.is_in(room_id) {
            return Err(SfuError::not_found("room", room_id));
        }
        let transport = self.owned_transport(session, transport_id).await?;
        let producer = self
            .producers
            .get(producer_id)
            .await
            .ok_or_else(|| SfuError::not_found("producer", producer_id))?;

        let capabilities = if rtp_capabilities.codecs.is_empty() {
            session.rtp_capabilities().clone()
        } else {
            rtp_capabilities
        };

        self.consumers
            .create(room_id, &transport, &producer, &capabilities, &peer_id)
            .await
    }

    pub async fn resume_consumer(
        &self,
        session: &PeerSession,
        consumer_id: ConsumerId,
    ) -> Result<()> {
        self.owned_consumer(session, consumer_id).await?;
        self.consumers.resume(consumer_id).await
    }

    pub async fn pause_consumer(
        &self,
        session: &PeerSession,
        consumer_id: ConsumerId,
    ) -> Result<()> {
        self.owned_consumer(session, consumer_id).await?;
        self.consumers.pause(consumer_id).await
    }

    pub async fn close_consumer(&self, session: &PeerSession, consumer_id: ConsumerId) {
        if self.owned_consumer(session, consumer_id).await.is_ok() {
            self.consumers.close(consumer_id).await;
        }
    }

    pub async fn close_producer(
        &self,
        session: &PeerSession,
        producer_id: ProducerId,
    ) -> Result<()> {
        if self.owned_producer(session, producer_id).await.is_none() {
            return Ok(());
        }
        let (room_id, peer_id) = Self::membership(session)?;
        let handle = self.existing_room(&room_id).await?;
        let room = handle.lock().await;

        let closed = self.producers.close(producer_id).await;
        self.announce_closed(&room, &closed, Some(&peer_id)).await;

        Ok(())
    }

    pub async fn close_transport(
        &self,
        session: &PeerSession,
        transport_id: TransportId,
    ) -> Result<()> {
        if self.owned_transport(session, transport_id).await.is_err() {
            return Ok(());
        }
        let (room_id, peer_id) = Self::membership(session)?;
        let handle = self.existing_room(&room_id).await?;
        let room = handle.lock().await;

        let closed = self.transports.close(transport_id).await;
        self.announce_closed(&room, &closed, Some(&peer_id)).await;

        Ok(())
    }

    pub async fn router_rtp_capabilities(&self, room_id: &RoomId) -> RtpCapabilities {
        self.routers.rtp_capabilities(room_id).await
    }

    /// Rebuild rooms whose router lived on a worker that crashed.
    ///
    /// The room's transports belonged to the dead router, so they are closed
    /// along with everything on them. A populated room gets a fresh router and
    /// its members are told to renegotiate.
    async fn reconcile_lost_worker(&self, worker_id: WorkerId) {
        let purged = self.routers.purge_worker(worker_id).await;

        for (room_id, router_id) in purged {
            let Ok(handle) = self.existing_room(&room_id).await else {
                continue;
            };
            let mut room = handle.lock().await;
            if room.closed {
                continue;
            }

            let closed = self.transports.close_for_router(router_id).await;
            self.announce_closed(&room, &closed, None).await;
            room.router = None;

            if room.peers.is_empty() {
                self.destroy_room(&handle, &mut room).await;
                continue;
            }

            match self.routers.get_or_create(&room_id).await {
                Ok(router) => {
                    tracing::info!(
                        "Room {} moved from router {} to {} on {}",
                        room_id,
                        router_id,
                        router.id(),
                        router.worker_id
                    );
                    room.router = Some(router);
                }
                Err(e) => {
                    // The next createTransport retries the router
                    tracing::error!("Failed to recreate router for room {}: {}", room_id, e);
                }
            }

            self.connections
                .broadcast_to_peers(
                    &room.id,
                    &room.peers,
                    &ServerMessage::RouterReset {
                        room_id: room.id.clone(),
                    },
                )
                .await;
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Members of a room in join order
    pub async fn peers(&self, room_id: &RoomId) -> Vec<PeerId> {
        match self.existing_room(room_id).await {
            Ok(handle) => handle.lock().await.peers.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Transports, producers and consumers a peer currently owns
    pub async fn resource_count(&self, room_id: &RoomId, peer_id: &PeerId) -> usize {
        self.transports.for_peer(room_id, peer_id).await.len()
            + self.producers.for_peer(room_id, peer_id).await.len()
            + self.consumers.for_peer(room_id, peer_id).await.len()
    }

    pub async fn has_router(&self, room_id: &RoomId) -> bool {
        self.routers.get(room_id).await.is_some()
    }

    pub fn routers(&self) -> &Arc<RouterRegistry> {
        &self.routers
    }

    pub fn transports(&self) -> &Arc<TransportManager> {
        &self.transports
    }

    pub fn producers(&self) -> &Arc<ProducerManager> {
        &self.producers
    }

    pub fn consumers(&self) -> &Arc<ConsumerManager> {
        &self.consumers
    }
}
