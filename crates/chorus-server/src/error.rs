use crate::engine::EngineError;
use chorus_protocol::{PeerId, ProducerId};
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("capabilities cannot decode producer {0}")]
    IncompatibleCapabilities(ProducerId),

    #[error("no media worker available")]
    NoWorkerAvailable,

    #[error("failed to start media workers: {0}")]
    WorkerInit(String),

    #[error("media engine operation failed: {0}")]
    EngineOperationFailed(#[from] EngineError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("peer {0} is already in the room")]
    PeerIdTaken(PeerId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SfuError {
    pub fn not_found(kind: &'static str, id: impl Display) -> Self {
        SfuError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code sent to clients in error frames
    pub fn code(&self) -> &'static str {
        match self {
            SfuError::NotFound { .. } => "not_found",
            SfuError::IncompatibleCapabilities(_) => "incompatible_capabilities",
            SfuError::NoWorkerAvailable => "no_worker_available",
            SfuError::WorkerInit(_) => "worker_init_failed",
            SfuError::EngineOperationFailed(_) => "engine_operation_failed",
            SfuError::InvalidState(_) => "invalid_state",
            SfuError::PeerIdTaken(_) => "peer_id_taken",
            SfuError::InvalidRequest(_) => "invalid_request",
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
