use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use zapper_hub::arbiter::{ArbiterConfig, RoleArbiter};
use zapper_hub::broadcast::ChannelBroadcaster;
use zapper_hub::config::{Cli, HubConfig, StoreBackend};
use zapper_hub::handlers::{self, AppState};
use zapper_hub::store::{CoordinationStore, MemoryStore};
use zapper_hub::store_redis::RedisStore;
use zapper_hub::sweep;
use zapper_hub::telemetry::Telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = Telemetry::init(&cli.log_filter)?;
    let config = HubConfig::try_from(cli)?;
    run(config, telemetry).await
}

async fn run(config: HubConfig, telemetry: Telemetry) -> anyhow::Result<()> {
    let store = build_store(&config).await;
    let broadcaster = Arc::new(ChannelBroadcaster::new());
    let arbiter = Arc::new(RoleArbiter::new(
        store.clone(),
        broadcaster.clone(),
        ArbiterConfig {
            cooldown_window: config.role_cooldown,
            lease_ttl: config.role_lock_ttl,
            lease_retry_attempts: config.lock_retry_attempts,
            lease_retry_delay: config.lock_retry_delay,
        },
    ));

    let sweeper = sweep::spawn_sweeper(store.clone(), arbiter.clone(), config.sweep_interval);

    let state = AppState {
        arbiter,
        broadcaster,
        metrics: telemetry.metrics_handle(),
    };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "zapper-hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    info!("zapper-hub stopped");
    Ok(())
}

async fn build_store(config: &HubConfig) -> Arc<dyn CoordinationStore> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("using in-memory coordination store; state is neither shared nor durable");
            Arc::new(MemoryStore::new(config.presence_ttl))
        }
        StoreBackend::Redis => {
            if let Some(url) = config.redis_url.as_deref() {
                match RedisStore::connect(url, config.presence_ttl).await {
                    Ok(store) => {
                        info!("connected to redis coordination store");
                        return Arc::new(store);
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to connect redis store; falling back to memory")
                    }
                }
            } else {
                warn!("store backend is redis but ZAPPER_HUB_REDIS_URL is missing; falling back to memory");
            }
            Arc::new(MemoryStore::new(config.presence_ttl))
        }
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
