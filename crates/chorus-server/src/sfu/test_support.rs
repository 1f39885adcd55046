//! Registry stack on the local engine for unit tests

use super::{ConsumerManager, ProducerManager, RouterRegistry, TransportManager, WorkerPool};
use crate::engine::{LocalEngine, TransportListenConfig};
use chorus_protocol::{
    PeerId, RoomId, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
use std::sync::Arc;

pub(super) struct Registries {
    pub engine: Arc<LocalEngine>,
    pub routers: Arc<RouterRegistry>,
    pub transports: Arc<TransportManager>,
    pub producers: Arc<ProducerManager>,
    pub consumers: Arc<ConsumerManager>,
}

pub(super) async fn registries() -> Registries {
    let engine = Arc::new(LocalEngine::new());
    let pool = WorkerPool::initialize(engine.clone(), 1).await.unwrap();
    let routers = Arc::new(RouterRegistry::new(pool, vec![RtpCodecCapability::opus()]));
    let consumers = Arc::new(ConsumerManager::new(routers.clone()));
    let producers = Arc::new(ProducerManager::new(consumers.clone()));
    let transports = Arc::new(TransportManager::new(
        routers.clone(),
        producers.clone(),
        consumers.clone(),
        TransportListenConfig::default(),
    ));

    Registries {
        engine,
        routers,
        transports,
        producers,
        consumers,
    }
}

pub(super) fn room() -> RoomId {
    RoomId::from("r1")
}

pub(super) fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

pub(super) fn opus_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability::opus()],
    }
}

pub(super) fn opus_parameters() -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Default::default(),
        }],
        encodings: vec![],
    }
}
