//! Chorus Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod db;
pub mod engine;
pub mod error;
pub mod services;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::Result;
use engine::{LocalEngine, MediaEngine};
use services::{MemorySessionRecords, PgSessionRecords, SessionRecordNotifier, SessionRecords};
use std::sync::Arc;

/// Create and configure the server application
pub async fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let records: Arc<dyn SessionRecords> = match &config.database_url {
        Some(url) => Arc::new(PgSessionRecords::new(db::init_pool(url)?)),
        None => Arc::new(MemorySessionRecords::new()),
    };

    create_app_with(config, Arc::new(LocalEngine::new()), records).await
}

/// Create the application on an explicit engine and session-record store
pub async fn create_app_with(
    config: state::Config,
    engine: Arc<dyn MediaEngine>,
    records: Arc<dyn SessionRecords>,
) -> Result<(axum::Router, state::AppState)> {
    let workers = sfu::WorkerPool::initialize(engine, config.num_workers).await?;
    let connections = Arc::new(ws::connections::ConnectionManager::new());
    let rooms = sfu::RoomManager::new(
        workers.clone(),
        config.listen.clone(),
        connections.clone(),
        SessionRecordNotifier::spawn(records),
    );

    let app_state = state::AppState {
        config,
        connections,
        workers,
        rooms,
    };
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
