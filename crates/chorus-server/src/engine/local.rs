//! In-process media engine
//!
//! Keeps the object graph a relay keeps (workers, routers, transports,
//! producers, consumers) and enforces the same rules on it, but moves no
//! media. Each worker is a tokio task standing in for a worker process; killing
//! it makes every handle it hosts fail and reports [`EngineEvent::WorkerDied`].

use super::{
    EngineConsumer, EngineError, EngineEvent, EngineProducer, EngineRouter, EngineTransport,
    EngineWorker, MediaEngine, TransportListenConfig, WorkerId,
};
use async_trait::async_trait;
use chorus_protocol::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, ProducerId, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, TransportId, TransportProtocol,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// First payload type handed out to router codecs without a preferred one
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

enum WorkerExit {
    Closed,
    Killed(String),
}

struct WorkerShared {
    id: WorkerId,
    alive: AtomicBool,
    exit: Mutex<Option<oneshot::Sender<WorkerExit>>>,
}

impl WorkerShared {
    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::WorkerClosed(self.id))
        }
    }

    fn stop(&self, exit: WorkerExit) -> bool {
        self.alive.store(false, Ordering::SeqCst);
        let sender = self
            .exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => sender.send(exit).is_ok(),
            None => false,
        }
    }
}

/// RTC ports in use across every worker of the engine
#[derive(Default)]
struct PortAllocator {
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    fn allocate(&self, min: u16, max: u16) -> Result<u16, EngineError> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let port = (min..=max)
            .find(|port| !used.contains(port))
            .ok_or(EngineError::NoPortAvailable { min, max })?;
        used.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    fn in_use(&self) -> usize {
        self.used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn ensure_open(
    worker: &WorkerShared,
    closed: &AtomicBool,
    what: &'static str,
) -> Result<(), EngineError> {
    worker.ensure_alive()?;
    if closed.load(Ordering::SeqCst) {
        return Err(EngineError::Closed(what));
    }
    Ok(())
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Media engine that runs entirely inside this process
#[derive(Default)]
pub struct LocalEngine {
    next_worker_id: AtomicU32,
    pending_spawn_failures: AtomicUsize,
    ports: Arc<PortAllocator>,
    workers: Mutex<HashMap<WorkerId, Arc<WorkerShared>>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `spawn_worker` fail
    pub fn fail_next_spawns(&self, count: usize) {
        self.pending_spawn_failures.store(count, Ordering::SeqCst);
    }

    /// Terminate a worker as if its process crashed.
    ///
    /// Returns false if the worker is unknown or already stopped.
    pub fn kill_worker(&self, worker_id: WorkerId) -> bool {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&worker_id);

        match worker {
            Some(worker) => {
                tracing::warn!("Killing {}", worker_id);
                worker.stop(WorkerExit::Killed("killed".to_string()))
            }
            None => false,
        }
    }

    /// Workers that are still running, in spawn order
    pub fn live_workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|w| w.alive.load(Ordering::SeqCst))
            .map(|w| w.id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of RTC ports currently held by open transports
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn spawn_worker(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn EngineWorker>, EngineError> {
        let injected_failure = self
            .pending_spawn_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(EngineError::Spawn("worker process exited during startup".to_string()));
        }

        let id = WorkerId(self.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let shared = Arc::new(WorkerShared {
            id,
            alive: AtomicBool::new(true),
            exit: Mutex::new(Some(exit_tx)),
        });

        let task_shared = shared.clone();
        tokio::spawn(async move {
            let exit = exit_rx.await.unwrap_or(WorkerExit::Closed);
            task_shared.alive.store(false, Ordering::SeqCst);

            if let WorkerExit::Killed(reason) = exit {
                if events
                    .send(EngineEvent::WorkerDied {
                        worker_id: id,
                        reason,
                    })
                    .is_err()
                {
                    tracing::debug!("Nobody is listening for the death of {}", id);
                }
            }
        });

        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, shared.clone());

        tracing::debug!("Spawned local {}", id);

        Ok(Arc::new(LocalWorker {
            shared,
            ports: self.ports.clone(),
        }))
    }
}

struct LocalWorker {
    shared: Arc<WorkerShared>,
    ports: Arc<PortAllocator>,
}

#[async_trait]
impl EngineWorker for LocalWorker {
    fn id(&self) -> WorkerId {
        self.shared.id
    }

    fn is_closed(&self) -> bool {
        !self.shared.alive.load(Ordering::SeqCst)
    }

    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn EngineRouter>, EngineError> {
        self.shared.ensure_alive()?;

        if media_codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one codec".to_string(),
            ));
        }

        let taken: BTreeSet<u8> = media_codecs
            .iter()
            .filter_map(|c| c.preferred_payload_type)
            .collect();
        let mut next_payload_type = DYNAMIC_PAYLOAD_TYPE_START;
        let codecs = media_codecs
            .into_iter()
            .map(|mut codec| {
                if codec.preferred_payload_type.is_none() {
                    while taken.contains(&next_payload_type) {
                        next_payload_type += 1;
                    }
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type += 1;
                }
                codec
            })
            .collect();

        tokio::task::yield_now().await;

        Ok(Arc::new(LocalRouter {
            inner: Arc::new(RouterShared {
                id: Uuid::new_v4(),
                worker: self.shared.clone(),
                capabilities: RtpCapabilities { codecs },
                producers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
            ports: self.ports.clone(),
        }))
    }

    async fn close(&self) {
        self.shared.stop(WorkerExit::Closed);
    }
}

struct RouterShared {
    id: Uuid,
    worker: Arc<WorkerShared>,
    capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, Arc<ProducerShared>>>,
    closed: AtomicBool,
}

impl RouterShared {
    fn router_codec(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.capabilities.codecs.iter().find(|c| codec.matches(c))
    }

    /// First producer codec the router carries and the remote side can decode
    fn negotiate<'a>(
        &self,
        producer_parameters: &'a RtpParameters,
        capabilities: &RtpCapabilities,
    ) -> Option<(&'a RtpCodecParameters, &RtpCodecCapability)> {
        producer_parameters.codecs.iter().find_map(|codec| {
            let router_codec = self.router_codec(codec)?;
            capabilities
                .codecs
                .iter()
                .any(|remote| codec.matches(remote))
                .then_some((codec, router_codec))
        })
    }

    fn producer(&self, producer_id: ProducerId) -> Option<Arc<ProducerShared>> {
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&producer_id)
            .cloned()
    }
}

struct LocalRouter {
    inner: Arc<RouterShared>,
    ports: Arc<PortAllocator>,
}

#[async_trait]
impl EngineRouter for LocalRouter {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.capabilities.clone()
    }

    fn can_consume(
        &self,
        producer_parameters: &RtpParameters,
        capabilities: &RtpCapabilities,
    ) -> bool {
        self.inner
            .negotiate(producer_parameters, capabilities)
            .is_some()
    }

    async fn create_webrtc_transport(
        &self,
        listen: &TransportListenConfig,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        ensure_open(&self.inner.worker, &self.inner.closed, "router")?;

        let port = self.ports.allocate(listen.rtc_min_port, listen.rtc_max_port)?;
        let ip = listen
            .announced_ip
            .clone()
            .unwrap_or_else(|| listen.listen_ip.to_string());

        let transport = LocalTransport {
            id: TransportId::new(),
            router: self.inner.clone(),
            ports: self.ports.clone(),
            port,
            ice_parameters: IceParameters {
                username_fragment: random_string(16),
                password: random_string(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1076302079,
                ip,
                protocol: TransportProtocol::Udp,
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            next_mid: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        tokio::task::yield_now().await;

        Ok(Arc::new(transport))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.inner.worker.ensure_alive()?;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

struct LocalTransport {
    id: TransportId,
    router: Arc<RouterShared>,
    ports: Arc<PortAllocator>,
    port: u16,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    next_mid: AtomicU32,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        ensure_open(&self.router.worker, &self.router.closed, "router")?;
        ensure_open(&self.router.worker, &self.closed, "transport")
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, remote: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;

        if remote.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "remote DTLS parameters carry no fingerprint".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidParameters(
                "transport is already connected".to_string(),
            ));
        }

        tokio::task::yield_now().await;
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;

        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "producer RTP parameters carry no codec".to_string(),
            ));
        }
        for codec in &rtp_parameters.codecs {
            let router_codec = self
                .router
                .router_codec(codec)
                .ok_or_else(|| EngineError::UnsupportedCodec(codec.mime_type.clone()))?;
            if router_codec.kind != kind {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {} is not a {} codec",
                    codec.mime_type, kind
                )));
            }
        }

        let shared = Arc::new(ProducerShared {
            id: ProducerId::new(),
            kind,
            rtp_parameters,
            worker: self.router.worker.clone(),
            closed: AtomicBool::new(false),
        });
        self.router
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shared.id, shared.clone());

        tokio::task::yield_now().await;

        Ok(Arc::new(LocalProducer {
            shared,
            router: self.router.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;

        let producer = self
            .router
            .producer(producer_id)
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .ok_or(EngineError::UnknownProducer(producer_id))?;

        let (codec, router_codec) = self
            .router
            .negotiate(&producer.rtp_parameters, capabilities)
            .ok_or(EngineError::CannotConsume(producer_id))?;

        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![RtpCodecParameters {
                payload_type: router_codec
                    .preferred_payload_type
                    .unwrap_or(codec.payload_type),
                ..codec.clone()
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(rand::random()),
            }],
        };

        tokio::task::yield_now().await;

        Ok(Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            kind: producer.kind,
            rtp_parameters,
            worker: self.router.worker.clone(),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ports.release(self.port);
        }
        self.router.worker.ensure_alive()
    }
}

struct ProducerShared {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    worker: Arc<WorkerShared>,
    closed: AtomicBool,
}

struct LocalProducer {
    shared: Arc<ProducerShared>,
    router: Arc<RouterShared>,
}

#[async_trait]
impl EngineProducer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.shared.id
    }

    fn kind(&self) -> MediaKind {
        self.shared.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.shared.rtp_parameters.clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.router
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.shared.id);
        self.shared.worker.ensure_alive()
    }
}

struct LocalConsumer {
    id: ConsumerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    worker: Arc<WorkerShared>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineConsumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        ensure_open(&self.worker, &self.closed, "consumer")?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        ensure_open(&self.worker, &self.closed, "consumer")?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        self.worker.ensure_alive()
    }
}
