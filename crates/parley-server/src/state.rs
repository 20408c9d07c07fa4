use crate::engine::EngineClient;
use crate::rooms::{InviteManager, RoomRegistry};
use crate::turn::{IceConfig, TurnConfig};
use crate::ws::ConnectionManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    /// Engine socket: `host:port` or `unix:/path/to.sock`.
    pub engine_addr: String,
    pub engine_workers: usize,
    pub engine_timeout_secs: u64,
    /// Default peer cap for lazily created rooms; `None` means unlimited.
    pub default_max_peers: Option<usize>,
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_secret: Option<String>,
    pub turn_ttl_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Load from environment variables, falling back to dev defaults.
        let bind_address =
            std::env::var("PARLEY_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5558".to_string());

        let engine_addr =
            std::env::var("PARLEY_ENGINE_ADDR").unwrap_or_else(|_| "127.0.0.1:4470".to_string());

        let engine_workers = std::env::var("PARLEY_ENGINE_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let engine_timeout_secs = std::env::var("PARLEY_ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let default_max_peers = std::env::var("PARLEY_MAX_PEERS")
            .ok()
            .and_then(|v| v.parse().ok());

        let stun_urls = std::env::var("PARLEY_STUN_SERVERS")
            .map(|s| s.split(',').map(|u| u.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]);

        let turn_urls: Vec<String> = std::env::var("PARLEY_TURN_URLS")
            .map(|s| s.split(',').map(|u| u.trim().to_string()).collect())
            .unwrap_or_default();

        let turn_secret = std::env::var("PARLEY_TURN_SECRET").ok();
        if !turn_urls.is_empty() && turn_secret.is_none() {
            tracing::warn!("PARLEY_TURN_URLS set without PARLEY_TURN_SECRET; TURN disabled");
        }

        let turn_ttl_secs = std::env::var("PARLEY_TURN_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(86400);

        let reconcile_interval_secs = std::env::var("PARLEY_RECONCILE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Ok(Config {
            bind_address,
            engine_addr,
            engine_workers,
            engine_timeout_secs,
            default_max_peers,
            stun_urls,
            turn_urls,
            turn_secret,
            turn_ttl_secs,
            reconcile_interval_secs,
        })
    }

    pub fn ice_config(&self) -> IceConfig {
        let turn = match (&self.turn_secret, self.turn_urls.is_empty()) {
            (Some(secret), false) => Some(TurnConfig {
                urls: self.turn_urls.clone(),
                secret: secret.clone(),
                ttl_secs: self.turn_ttl_secs,
            }),
            _ => None,
        };
        IceConfig {
            stun_urls: self.stun_urls.clone(),
            turn,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: EngineClient,
    pub registry: Arc<RoomRegistry>,
    pub invites: Arc<InviteManager>,
    pub connections: Arc<ConnectionManager>,
    pub ice: Arc<IceConfig>,
}

impl AppState {
    pub fn new(config: Config, engine: EngineClient) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            engine.clone(),
            config.engine_workers,
            config.default_max_peers,
        ));
        let ice = Arc::new(config.ice_config());

        Self {
            config,
            engine,
            registry,
            invites: Arc::new(InviteManager::new()),
            connections: Arc::new(ConnectionManager::new()),
            ice,
        }
    }
}
