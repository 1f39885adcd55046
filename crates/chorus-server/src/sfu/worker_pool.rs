//! Worker Pool
//!
//! Owns the media engine's worker processes and picks one to host each new
//! router. A supervisor task replaces workers that die and announces the loss
//! so routers hosted on them can be reconciled.

use crate::engine::{EngineEvent, EngineWorker, MediaEngine, WorkerId};
use crate::error::{Result, SfuError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};

struct PooledWorker {
    worker: Arc<dyn EngineWorker>,
    /// Routers currently hosted on this worker
    routers: usize,
}

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    /// Registration order doubles as the tie-break order in `acquire`
    workers: Mutex<Vec<PooledWorker>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    lost_tx: broadcast::Sender<WorkerId>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    /// Spawn `count` workers and start the supervisor.
    ///
    /// Individual spawn failures are logged and skipped; only a pool with no
    /// running worker at all is an error.
    pub async fn initialize(engine: Arc<dyn MediaEngine>, count: usize) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lost_tx, _) = broadcast::channel(64);

        let pool = Arc::new(Self {
            engine,
            workers: Mutex::new(Vec::with_capacity(count)),
            events_tx,
            lost_tx,
            shutting_down: AtomicBool::new(false),
        });

        for index in 0..count {
            if let Err(e) = pool.spawn_one().await {
                tracing::error!("Failed to spawn media worker {}/{}: {}", index + 1, count, e);
            }
        }

        let running = pool.len();
        if running == 0 {
            return Err(SfuError::WorkerInit(format!(
                "none of {} media workers could be started",
                count
            )));
        }

        tokio::spawn(Self::supervise(Arc::downgrade(&pool), events_rx));

        tracing::info!("Worker pool running with {}/{} workers", running, count);
        Ok(pool)
    }

    async fn spawn_one(&self) -> Result<WorkerId> {
        let worker = self.engine.spawn_worker(self.events_tx.clone()).await?;
        let id = worker.id();

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PooledWorker { worker, routers: 0 });

        tracing::info!("Media {} started", id);
        Ok(id)
    }

    async fn supervise(pool: Weak<Self>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };

            match event {
                EngineEvent::WorkerDied { worker_id, reason } => {
                    pool.handle_worker_died(worker_id, &reason).await;
                }
            }
        }
    }

    async fn handle_worker_died(&self, worker_id: WorkerId, reason: &str) {
        let removed = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            let before = workers.len();
            workers.retain(|w| w.worker.id() != worker_id);
            before != workers.len()
        };

        if !removed {
            tracing::debug!("Ignoring death of unmanaged {}", worker_id);
            return;
        }

        tracing::error!("Media {} died unexpectedly: {}", worker_id, reason);

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        match self.spawn_one().await {
            Ok(replacement) => {
                tracing::info!("Replaced media {} with {}", worker_id, replacement);
            }
            Err(e) => {
                tracing::error!("Failed to replace media {}: {}", worker_id, e);
            }
        }

        // Announce after the replacement exists so reconciliation can place
        // new routers even when the pool had a single worker.
        if self.lost_tx.send(worker_id).is_err() {
            tracing::debug!("No subscriber for the loss of {}", worker_id);
        }
    }

    /// Pick the worker hosting the fewest routers (first registered wins a tie)
    /// and count one more router against it.
    pub fn acquire(&self) -> Result<Arc<dyn EngineWorker>> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let slot = workers
            .iter_mut()
            .filter(|w| !w.worker.is_closed())
            .min_by_key(|w| w.routers)
            .ok_or(SfuError::NoWorkerAvailable)?;

        slot.routers += 1;
        Ok(slot.worker.clone())
    }

    /// Give back the router slot taken by `acquire`
    pub fn release(&self, worker_id: WorkerId) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = workers.iter_mut().find(|w| w.worker.id() == worker_id) {
            slot.routers = slot.routers.saturating_sub(1);
        }
    }

    /// Notifications of workers lost to a crash
    pub fn subscribe_lost(&self) -> broadcast::Receiver<WorkerId> {
        self.lost_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Router count per worker, in registration order
    pub fn loads(&self) -> Vec<(WorkerId, usize)> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| (w.worker.id(), w.routers))
            .collect()
    }

    /// Close every worker. Safe to call on an empty pool or more than once.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let workers: Vec<PooledWorker> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for pooled in workers {
            pooled.worker.close().await;
            tracing::info!("Media {} closed", pooled.worker.id());
        }
    }
}
