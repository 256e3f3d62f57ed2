use std::time::Duration;

use serde::Deserialize;

/// Top-level server configuration, loaded from `blokus.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Name this process claims room ownership under. Must be unique
    /// across processes sharing a Room Cache.
    pub instance_id: String,
    pub limits: LimitsConfig,
    pub turns: TurnsConfig,
    pub relay: RelayConfig,
    pub cache: CacheConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            limits: LimitsConfig::default(),
            turns: TurnsConfig::default(),
            relay: RelayConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    pub ws_rate_limit_per_sec: f64,
    /// Outbound frames queued per connection before frames are dropped.
    pub connection_buffer: usize,
    pub max_message_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 200,
            ws_rate_limit_per_sec: 20.0,
            connection_buffer: 256,
            max_message_size: blokus_core::net::protocol::MAX_MESSAGE_SIZE,
        }
    }
}

/// Turn clock configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TurnsConfig {
    pub timeout_secs: u64,
    /// Extra time granted past the client-visible timeout before the
    /// server skips the turn itself.
    pub grace_ms: u64,
    pub score_confirm_secs: u64,
}

impl Default for TurnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            grace_ms: 1500,
            score_confirm_secs: 15,
        }
    }
}

impl TurnsConfig {
    pub fn turn_deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs) + Duration::from_millis(self.grace_ms)
    }

    pub fn score_confirm_window(&self) -> Duration {
        Duration::from_secs(self.score_confirm_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Compare-and-swap retries before a room update fails.
    pub max_update_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: 8,
        }
    }
}

impl ServerConfig {
    /// Problems that make this configuration unusable. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!(
                "listen_addr {:?} is not a valid socket address",
                self.listen_addr
            ));
        }
        if self.instance_id.trim().is_empty() {
            problems.push("instance_id must not be empty".to_string());
        }
        if self.limits.max_ws_connections == 0 {
            problems.push("limits.max_ws_connections must be > 0".to_string());
        }
        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            problems.push("limits.ws_rate_limit_per_sec must be > 0".to_string());
        }
        if self.limits.connection_buffer == 0 {
            problems.push("limits.connection_buffer must be > 0".to_string());
        }
        if self.limits.max_message_size == 0 {
            problems.push("limits.max_message_size must be > 0".to_string());
        }
        if self.turns.timeout_secs == 0 {
            problems.push("turns.timeout_secs must be > 0".to_string());
        }
        if self.turns.score_confirm_secs == 0 {
            problems.push("turns.score_confirm_secs must be > 0".to_string());
        }
        if self.relay.channel_capacity == 0 {
            problems.push("relay.channel_capacity must be > 0".to_string());
        }
        if self.cache.max_update_attempts == 0 {
            problems.push("cache.max_update_attempts must be > 0".to_string());
        }
        problems
    }

    /// Load config from `blokus.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("blokus.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from blokus.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse blokus.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No blokus.toml found, using defaults");
                ServerConfig::default()
            },
        };

        if let Ok(addr) = std::env::var("BLOKUS_LISTEN_ADDR")
            && !addr.is_empty()
        {
            config.listen_addr = addr;
        }
        if let Ok(id) = std::env::var("BLOKUS_INSTANCE_ID")
            && !id.is_empty()
        {
            config.instance_id = id;
        }
        if let Ok(val) = std::env::var("BLOKUS_TURN_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.turns.timeout_secs = n;
        }
        if let Ok(val) = std::env::var("BLOKUS_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.max_ws_connections = n;
        }
        if let Ok(val) = std::env::var("BLOKUS_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            config.limits.ws_rate_limit_per_sec = n;
        }

        config
    }
}
