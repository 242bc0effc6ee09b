//! CLI and runtime configuration. Every flag doubles as a `ZAPPER_HUB_*`
//! environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

pub const DEFAULT_PRESENCE_TTL_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_ROLE_COOLDOWN_MS: u64 = 3_000;
pub const DEFAULT_ROLE_LOCK_TTL_MS: u64 = 5_000;
pub const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 100;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "zapper-hub",
    about = "Presence and role arbitration hub for Zapper remote-control sessions"
)]
pub struct Cli {
    #[arg(long, env = "ZAPPER_HUB_LISTEN_ADDR", default_value = "127.0.0.1:9600")]
    pub listen_addr: String,

    /// Redis connection string; without one the hub falls back to the
    /// in-memory store (single process only).
    #[arg(long, env = "ZAPPER_HUB_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Coordination store backend: "redis" or "memory".
    #[arg(long, env = "ZAPPER_HUB_STORE", default_value = "redis")]
    pub store: String,

    #[arg(long, env = "ZAPPER_HUB_PRESENCE_TTL_SECS", default_value_t = DEFAULT_PRESENCE_TTL_SECS)]
    pub presence_ttl_secs: u64,

    #[arg(long, env = "ZAPPER_HUB_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "ZAPPER_HUB_ROLE_COOLDOWN_MS", default_value_t = DEFAULT_ROLE_COOLDOWN_MS)]
    pub role_cooldown_ms: u64,

    #[arg(long, env = "ZAPPER_HUB_ROLE_LOCK_TTL_MS", default_value_t = DEFAULT_ROLE_LOCK_TTL_MS)]
    pub role_lock_ttl_ms: u64,

    #[arg(long, env = "ZAPPER_HUB_LOCK_RETRY_ATTEMPTS", default_value_t = DEFAULT_LOCK_RETRY_ATTEMPTS)]
    pub lock_retry_attempts: u32,

    #[arg(long, env = "ZAPPER_HUB_LOCK_RETRY_DELAY_MS", default_value_t = DEFAULT_LOCK_RETRY_DELAY_MS)]
    pub lock_retry_delay_ms: u64,

    /// Default tracing filter; RUST_LOG overrides it.
    #[arg(long, env = "ZAPPER_HUB_LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub store_backend: StoreBackend,
    pub presence_ttl: Duration,
    pub sweep_interval: Duration,
    pub role_cooldown: Duration,
    pub role_lock_ttl: Duration,
    pub lock_retry_attempts: u32,
    pub lock_retry_delay: Duration,
    pub log_filter: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr}: {source}")]
    InvalidListenAddr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("unknown store backend {0:?} (expected \"redis\" or \"memory\")")]
    UnknownStoreBackend(String),
    #[error("lock retry attempts must be at least 1")]
    NoLockRetryAttempts,
}

impl TryFrom<Cli> for HubConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr =
            cli.listen_addr
                .parse()
                .map_err(|source| ConfigError::InvalidListenAddr {
                    addr: cli.listen_addr.clone(),
                    source,
                })?;
        let store_backend = match cli.store.as_str() {
            "redis" => StoreBackend::Redis,
            "memory" => StoreBackend::Memory,
            other => return Err(ConfigError::UnknownStoreBackend(other.to_string())),
        };
        if cli.lock_retry_attempts == 0 {
            return Err(ConfigError::NoLockRetryAttempts);
        }
        Ok(Self {
            listen_addr,
            redis_url: cli.redis_url,
            store_backend,
            presence_ttl: Duration::from_secs(cli.presence_ttl_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            role_cooldown: Duration::from_millis(cli.role_cooldown_ms),
            role_lock_ttl: Duration::from_millis(cli.role_lock_ttl_ms),
            lock_retry_attempts: cli.lock_retry_attempts,
            lock_retry_delay: Duration::from_millis(cli.lock_retry_delay_ms),
            log_filter: cli.log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_a_config() {
        let cli = Cli::parse_from(["zapper-hub"]);
        let config = HubConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 9600);
        assert_eq!(config.store_backend, StoreBackend::Redis);
        assert_eq!(config.presence_ttl, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.role_cooldown, Duration::from_millis(3_000));
        assert_eq!(config.role_lock_ttl, Duration::from_millis(5_000));
    }

    #[test]
    fn rejects_unknown_store_backend() {
        let cli = Cli::parse_from(["zapper-hub", "--store", "etcd"]);
        assert!(matches!(
            HubConfig::try_from(cli),
            Err(ConfigError::UnknownStoreBackend(_))
        ));
    }

    #[test]
    fn rejects_malformed_listen_addr() {
        let cli = Cli::parse_from(["zapper-hub", "--listen-addr", "not-an-addr"]);
        assert!(matches!(
            HubConfig::try_from(cli),
            Err(ConfigError::InvalidListenAddr { .. })
        ));
    }
}
