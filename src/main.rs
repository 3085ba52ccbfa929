use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::{error, info, warn};

mod api;
mod config;
mod models;
mod pipeline;
mod services;
mod validation;

use api::handlers::AppState;
use config::Config;
use pipeline::Orchestrator;
use services::database::{DatabaseAdapter, SqliteAdapter};
use services::llm_client::HttpLlmClient;
use services::metrics::LogMetrics;
use services::query_cache::QueryCache;
use services::schema_store::{SchemaPreview, SchemaStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting server on {}", config.server_address());

    let adapter: Arc<dyn DatabaseAdapter> = Arc::new(SqliteAdapter::new());
    let schemas = Arc::new(SchemaStore::new());
    let cache = Arc::new(QueryCache::new(
        config.cache.capacity,
        Duration::from_secs(config.cache.ttl_secs),
    ));
    let llm = Arc::new(HttpLlmClient::new(&config.llm));

    register_datasets(&config, adapter.as_ref(), &schemas).await;

    // Periodic sweep so expired entries do not linger at low traffic.
    let sweep_cache = cache.clone();
    let sweep_interval = Duration::from_secs(config.cache.ttl_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            sweep_cache.cleanup_expired();
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        adapter.clone(),
        cache,
        schemas.clone(),
        Arc::new(LogMetrics),
        &config,
    ));

    let state = AppState {
        orchestrator,
        adapter,
        schemas,
    };
    let app: Router = api::routes::create_router_with_state(state);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Register every SQLite file found in the data directory. A dataset's id
/// is its file stem. Startup proceeds even if the directory is missing;
/// datasets can still be registered over the API.
async fn register_datasets(config: &Config, adapter: &dyn DatabaseAdapter, schemas: &SchemaStore) {
    let dir = std::path::Path::new(&config.datasets.data_dir);
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Data directory {} not readable: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_sqlite = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("db") | Some("sqlite") | Some("sqlite3")
        );
        if !is_sqlite {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let path_str = path.to_string_lossy().to_string();
        match adapter.introspect(&path_str).await {
            Ok(columns) => {
                schemas.register(id, &path_str, SchemaPreview::new(id, columns));
            }
            Err(e) => {
                warn!("Skipping dataset {}: {}", path.display(), e);
            }
        }
    }
}
