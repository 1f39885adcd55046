//! Router Registry
//!
//! One engine router per room. Creation is single-flight per room id: callers
//! racing on an unseen room share one `OnceCell` and converge on one router.

use super::WorkerPool;
use crate::engine::{EngineRouter, WorkerId};
use crate::error::Result;
use chorus_protocol::{RoomId, RtpCapabilities, RtpCodecCapability};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

/// A room's router and the worker hosting it
pub struct RouterEntry {
    pub room_id: RoomId,
    pub handle: Arc<dyn EngineRouter>,
    pub worker_id: WorkerId,
}

impl RouterEntry {
    pub fn id(&self) -> Uuid {
        self.handle.id()
    }
}

type RouterSlot = Arc<OnceCell<Arc<RouterEntry>>>;

pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    media_codecs: Vec<RtpCodecCapability>,
    routers: Mutex<HashMap<RoomId, RouterSlot>>,
}

impl RouterRegistry {
    pub fn new(pool: Arc<WorkerPool>, media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            pool,
            media_codecs,
            routers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the room's router, creating it on first use
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<RouterEntry>> {
        let slot = self
            .routers
            .lock()
            .await
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = slot
            .get_or_try_init(|| self.create_router(room_id))
            .await
            .cloned();

        if result.is_err() {
            // Leave no empty slot behind so the next caller retries cleanly
            let mut routers = self.routers.lock().await;
            let stale = routers
                .get(room_id)
                .map(|current| Arc::ptr_eq(current, &slot) && current.get().is_none())
                .unwrap_or(false);
            if stale {
                routers.remove(room_id);
            }
        }

        result
    }

    async fn create_router(&self, room_id: &RoomId) -> Result<Arc<RouterEntry>> {
        let worker = self.pool.acquire()?;
        let worker_id = worker.id();

        match worker.create_router(self.media_codecs.clone()).await {
            Ok(handle) => {
                tracing::info!(
                    "Created router {} for room {} on {}",
                    handle.id(),
                    room_id,
                    worker_id
                );
                Ok(Arc::new(RouterEntry {
                    room_id: room_id.clone(),
                    handle,
                    worker_id,
                }))
            }
            Err(e) => {
                self.pool.release(worker_id);
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<Arc<RouterEntry>> {
        self.routers
            .lock()
            .await
            .get(room_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Capabilities of the room's router, or of the profile a new router would get
    pub async fn rtp_capabilities(&self, room_id: &RoomId) -> RtpCapabilities {
        match self.get(room_id).await {
            Some(router) => router.handle.rtp_capabilities(),
            None => RtpCapabilities {
                codecs: self.media_codecs.clone(),
            },
        }
    }

    /// Close and forget the room's router. Engine failures are logged only:
    /// the room is going away either way.
    pub async fn close(&self, room_id: &RoomId) {
        let slot = self.routers.lock().await.remove(room_id);
        let Some(router) = slot.and_then(|slot| slot.get().cloned()) else {
            return;
        };

        if let Err(e) = router.handle.close().await {
            tracing::warn!("Error closing router {} of room {}: {}", router.id(), room_id, e);
        }
        self.pool.release(router.worker_id);

        tracing::info!("Closed router {} for room {}", router.id(), room_id);
    }

    /// Drop every router hosted by a dead worker without calling into the
    /// engine. Returns the affected rooms with the id of the router they lost.
    pub async fn purge_worker(&self, worker_id: WorkerId) -> Vec<(RoomId, Uuid)> {
        let mut routers = self.routers.lock().await;
        let mut purged = Vec::new();

        routers.retain(|room_id, slot| match slot.get() {
            Some(router) if router.worker_id == worker_id => {
                purged.push((room_id.clone(), router.id()));
                false
            }
            _ => true,
        });

        for (room_id, router_id) in &purged {
            tracing::warn!(
                "Purged router {} of room {} hosted on dead {}",
                router_id,
                room_id,
                worker_id
            );
        }

        purged
    }

    pub async fn len(&self) -> usize {
        self.routers
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::error::SfuError;

    async fn registry(workers: usize) -> (Arc<LocalEngine>, Arc<WorkerPool>, Arc<RouterRegistry>) {
        let engine = Arc::new(LocalEngine::new());
        let pool = WorkerPool::initialize(engine.clone(), workers).await.unwrap();
        let registry = Arc::new(RouterRegistry::new(
            pool.clone(),
            vec![RtpCodecCapability::opus()],
        ));
        (engine, pool, registry)
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_is_single_flight() {
        let (_engine, pool, registry) = registry(2).await;
        let room = RoomId::from("r1");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let room = room.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&room).await.map(|r| r.id())
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len().await, 1);
        let total: usize = pool.loads().iter().map(|(_, n)| n).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_close_releases_worker_and_is_idempotent() {
        let (_engine, pool, registry) = registry(1).await;
        let room = RoomId::from("r1");

        registry.get_or_create(&room).await.unwrap();
        assert_eq!(pool.loads()[0].1, 1);

        registry.close(&room).await;
        registry.close(&room).await;
        assert!(registry.get(&room).await.is_none());
        assert_eq!(pool.loads()[0].1, 0);
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_no_entry() {
        let (_engine, pool, registry) = registry(1).await;
        pool.shutdown().await;

        let result = registry.get_or_create(&RoomId::from("r1")).await;
        assert!(matches!(result, Err(SfuError::NoWorkerAvailable)));
        assert!(registry.routers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_worker_only_drops_its_routers() {
        let (_engine, _pool, registry) = registry(2).await;
        let a = registry.get_or_create(&RoomId::from("a")).await.unwrap();
        let b = registry.get_or_create(&RoomId::from("b")).await.unwrap();
        assert_ne!(a.worker_id, b.worker_id);

        let purged = registry.purge_worker(a.worker_id).await;
        assert_eq!(purged, vec![(RoomId::from("a"), a.id())]);
        assert!(registry.get(&RoomId::from("a")).await.is_none());
        assert!(registry.get(&RoomId::from("b")).await.is_some());
    }
}
