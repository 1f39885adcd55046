use crate::engine::TransportListenConfig;
use crate::sfu::{RoomManager, WorkerPool};
use crate::ws::connections::ConnectionManager;
use anyhow::Context;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub num_workers: usize,
    pub listen: TransportListenConfig,
    /// Session-record database; counters stay in memory when unset
    pub database_url: Option<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let num_workers = match env_parse::<usize>("SFU_NUM_WORKERS")? {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        let defaults = TransportListenConfig::default();
        let listen = TransportListenConfig {
            listen_ip: env_parse::<IpAddr>("SFU_LISTEN_IP")?.unwrap_or(defaults.listen_ip),
            announced_ip: std::env::var("SFU_ANNOUNCED_IP").ok(),
            rtc_min_port: env_parse("SFU_RTC_MIN_PORT")?.unwrap_or(defaults.rtc_min_port),
            rtc_max_port: env_parse("SFU_RTC_MAX_PORT")?.unwrap_or(defaults.rtc_max_port),
        };

        if listen.rtc_min_port > listen.rtc_max_port {
            anyhow::bail!(
                "SFU_RTC_MIN_PORT ({}) is above SFU_RTC_MAX_PORT ({})",
                listen.rtc_min_port,
                listen.rtc_max_port
            );
        }

        let database_url = std::env::var("DATABASE_URL").ok();
        if database_url.is_none() {
            tracing::warn!("DATABASE_URL not set, participant counts are kept in memory only");
        }

        Ok(Config {
            bind_address,
            num_workers,
            listen,
            database_url,
        })
    }
}

fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", name, value)),
        Err(_) => Ok(None),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub workers: Arc<WorkerPool>,
    pub rooms: Arc<RoomManager>,
}
