//! Media engine boundary
//!
//! The orchestrator never touches RTP, ICE or DTLS itself. Everything it needs
//! from the relay goes through these traits: create a router, create a
//! transport, produce, consume, close. Engine notifications (a worker dying)
//! are delivered as [`EngineEvent`] messages on the channel handed to
//! [`MediaEngine::spawn_worker`].

pub mod local;

use async_trait::async_trait;
use chorus_protocol::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId,
};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use local::LocalEngine;

/// Identifier of a worker process inside an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("{0} is closed")]
    WorkerClosed(WorkerId),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("codec {0} is not supported by the router")]
    UnsupportedCodec(String),

    #[error("producer {0} does not exist on this router")]
    UnknownProducer(ProducerId),

    #[error("capabilities cannot consume producer {0}")]
    CannotConsume(ProducerId),

    #[error("no free RTC port in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Notifications emitted by the engine outside of any call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A worker terminated without being asked to
    WorkerDied { worker_id: WorkerId, reason: String },
}

/// Where transports listen for media
#[derive(Debug, Clone)]
pub struct TransportListenConfig {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates when the server sits behind NAT
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for TransportListenConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: None,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start a worker. The worker reports its own unexpected death on `events`.
    async fn spawn_worker(
        &self,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn EngineWorker>, EngineError>;
}

#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    fn is_closed(&self) -> bool;

    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn EngineRouter>, EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait EngineRouter: Send + Sync {
    fn id(&self) -> Uuid;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether an endpoint with `capabilities` can decode what a producer
    /// with `producer_parameters` sends through this router
    fn can_consume(
        &self,
        producer_parameters: &RtpParameters,
        capabilities: &RtpCapabilities,
    ) -> bool;

    async fn create_webrtc_transport(
        &self,
        listen: &TransportListenConfig,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    async fn connect(&self, remote: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
