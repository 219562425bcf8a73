use anyhow::Result;
use gatekeeper::algorithms::SystemClock;
use gatekeeper::config::Config;
use gatekeeper::config_validator::ConfigValidator;
use gatekeeper::health::HealthChecker;
use gatekeeper::server::Server;
use gatekeeper::store::{CounterStore, MemoryCounterStore};
use gatekeeper::{RedisCounterStore, Throttler};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    HealthChecker::mark_started();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gatekeeper={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gatekeeper");
    tracing::info!(
        "Configuration: bind_addr={}, store={}, rules_file={:?}",
        config.bind_addr,
        if config.uses_redis() { "redis" } else { "memory" },
        config.rules_file
    );

    let rules = config
        .load_rules()
        .map_err(|e| anyhow::anyhow!("Failed to load rules: {}", e))?;

    let store: Arc<dyn CounterStore> = if config.uses_redis() {
        ConfigValidator::validate_redis_url(&config.redis_url)
            .map_err(|e| anyhow::anyhow!("Invalid REDIS_URL: {}", e))?;
        Arc::new(RedisCounterStore::new(&config.redis_url)?)
    } else {
        let memory = Arc::new(MemoryCounterStore::new());
        memory
            .clone()
            .spawn_sweeper(config.cleanup_interval(), Arc::new(SystemClock));
        memory
    };

    if config.key_hash_secret.is_empty() {
        tracing::warn!("KEY_HASH_SECRET is not set; bucket keys use an unkeyed hash");
    }

    if config.admin_token.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("ADMIN_TOKEN is not set; the /admin API will refuse all requests");
    }

    let throttler = Arc::new(Throttler::new(rules, store, config.key_hash_secret.as_bytes())?);

    Server::new(&config, throttler, config.rules_file.clone())
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
