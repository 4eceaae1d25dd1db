use clap::Parser;
use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exchange_federator::config::{Cli, Config, LogFormat, StoreBackend};
use exchange_federator::error::{ConfigError, StoreError};
use exchange_federator::schema_store::{InMemorySchemaStore, NewSchema, SchemaStore};
use exchange_federator::server::{AppState, serve};
use exchange_federator::sqlite_store::SqliteSchemaStore;

const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = Config::load(&cli.config, cli.config_required())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> Result<Arc<dyn SchemaStore>, StoreError> {
    let store: Arc<dyn SchemaStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemorySchemaStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteSchemaStore::open(&config.store.path)?),
    };
    Ok(store)
}

/// Registers and activates the configured SDL when nothing is active yet.
async fn bootstrap(store: &dyn SchemaStore, config: &Config) -> Result<(), Box<dyn Error>> {
    let Some(path) = &config.bootstrap_schema else {
        return Ok(());
    };
    if let Some(active) = store.get_active_schema().await? {
        info!(version = %active.version, "Active schema present, skipping bootstrap");
        return Ok(());
    }

    let sdl = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let schema = store.register_schema(NewSchema::new(sdl, "bootstrap")).await?;
    store.activate_schema(&schema.version, true).await?;
    info!(version = %schema.version, path = %path.display(), "Bootstrap schema activated");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    let store = open_store(&config)?;
    if let Err(e) = bootstrap(store.as_ref(), &config).await {
        error!(error = %e, "Failed to bootstrap schema");
        return Err(e);
    }

    let state = Arc::new(AppState::from_config(&config, store)?);
    let gateway = state.gateway.clone();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        address = %addr,
        providers = config.providers.len(),
        store = ?config.store.backend,
        "Exchange federator listening"
    );

    tokio::select! {
        result = serve(listener, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, gateway.audit().drain())
        .await
        .is_err()
    {
        warn!("Audit events still in flight at shutdown");
    }
    Ok(())
}
