use chorus_protocol::{PeerId, RoomId, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from (room, peer) to the connection that joined as that peer
    peers: RwLock<HashMap<(RoomId, PeerId), Uuid>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("Connection {} opened", connection_id);
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        self.peers
            .write()
            .await
            .retain(|_, conn_id| *conn_id != connection_id);
        self.senders.write().await.remove(&connection_id);

        tracing::debug!("Connection {} closed", connection_id);
    }

    pub async fn register_peer(&self, room_id: &RoomId, peer_id: &PeerId, connection_id: Uuid) {
        self.peers
            .write()
            .await
            .insert((room_id.clone(), peer_id.clone()), connection_id);
    }

    pub async fn unregister_peer(&self, room_id: &RoomId, peer_id: &PeerId) {
        self.peers
            .write()
            .await
            .remove(&(room_id.clone(), peer_id.clone()));
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&connection_id) {
            if let Err(e) = sender.send(json) {
                tracing::error!("Failed to send message to {}: {}", connection_id, e);
            }
        }
    }

    pub async fn send_to_peer(&self, room_id: &RoomId, peer_id: &PeerId, message: &ServerMessage) {
        let connection_id = self
            .peers
            .read()
            .await
            .get(&(room_id.clone(), peer_id.clone()))
            .copied();

        match connection_id {
            Some(connection_id) => self.send_to_connection(connection_id, message).await,
            None => tracing::debug!("No connection for peer {} in room {}", peer_id, room_id),
        }
    }

    /// Send one message to several peers of a room, serializing it once
    pub async fn broadcast_to_peers(
        &self,
        room_id: &RoomId,
        peer_ids: &[PeerId],
        message: &ServerMessage,
    ) {
        if peer_ids.is_empty() {
            return;
        }

        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let peers = self.peers.read().await;
        let senders = self.senders.read().await;

        tracing::debug!("Broadcasting to {} peers of room {}", peer_ids.len(), room_id);
        for peer_id in peer_ids {
            let Some(conn_id) = peers.get(&(room_id.clone(), peer_id.clone())) else {
                continue;
            };
            if let Some(sender) = senders.get(conn_id) {
                if let Err(e) = sender.send(json.clone()) {
                    tracing::error!("Failed to send message to peer {} ({}): {}", peer_id, conn_id, e);
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_only_listed_peers() {
        let manager = ConnectionManager::new();
        let room = RoomId::from("r1");
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (a_conn, b_conn) = (Uuid::new_v4(), Uuid::new_v4());

        manager.add_connection(a_conn, a_tx).await;
        manager.add_connection(b_conn, b_tx).await;
        manager.register_peer(&room, &PeerId::from("a"), a_conn).await;
        manager.register_peer(&room, &PeerId::from("b"), b_conn).await;

        let message = ServerMessage::PeerLeft {
            peer_id: PeerId::from("c"),
        };
        manager
            .broadcast_to_peers(&room, &[PeerId::from("b")], &message)
            .await;

        let received = b_rx.recv().await.unwrap();
        assert!(received.contains("\"peerLeft\""));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_connection_drops_peer_mapping() {
        let manager = ConnectionManager::new();
        let room = RoomId::from("r1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();

        manager.add_connection(conn, tx).await;
        manager.register_peer(&room, &PeerId::from("a"), conn).await;
        manager.remove_connection(conn).await;

        manager
            .send_to_peer(
                &room,
                &PeerId::from("a"),
                &ServerMessage::NewPeer {
                    peer_id: PeerId::from("b"),
                },
            )
            .await;

        assert_eq!(manager.connection_count().await, 0);
        assert!(rx.recv().await.is_none());
    }
}
