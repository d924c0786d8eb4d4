use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, info};

mod config;
mod error;
mod handlers;
mod providers;
mod relay;
mod storage;

use config::Config;
use providers::StorageProvider;
use relay::RelayOptions;
use shared::observability::{init_logging, LogConfig};
use storage::TempStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn StorageProvider>,
    pub temp_store: TempStore,
    pub relay_options: RelayOptions,
}

impl AppState {
    pub fn new(config: Config, provider: Arc<dyn StorageProvider>) -> anyhow::Result<Self> {
        let temp_store = TempStore::new(
            config.upload.temp_dir.clone(),
            config.upload.max_file_size_bytes,
        )?;
        let relay_options = RelayOptions {
            parent: config.destination_parent().to_string(),
            timestamp_prefix: config.upload.timestamp_prefix,
        };

        Ok(Self {
            config: Arc::new(config),
            provider,
            temp_store,
            relay_options,
        })
    }
}

/// Build the HTTP surface: the upload endpoint, a health probe, and the
/// static frontend for everything else.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = state.config.upload.request_body_limit();
    let frontend = ServeDir::new(&state.config.upload.static_dir);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/upload", post(handlers::upload::upload_files))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .fallback_service(frontend)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn load_config() -> anyhow::Result<Config> {
    let config = Config::from_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_logging(LogConfig::from_env("relay-service")?)?;

    info!("Starting Upload Relay...");

    // Credentials are checked once, up front
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        provider = config.provider.name(),
        mode = ?config.upload.mode,
        timestamp_prefix = config.upload.timestamp_prefix,
        "Configuration loaded successfully"
    );

    let provider = match providers::from_config(&config.provider) {
        Ok(provider) => provider,
        Err(e) => {
            error!("Failed to initialize storage provider: {:#}", e);
            std::process::exit(1);
        }
    };

    let addr = config.server.bind_address();
    let state = AppState::new(config, provider)?;
    info!(
        "Temporary uploads in {} (max {} bytes per file)",
        state.temp_store.dir().display(),
        state.temp_store.max_file_size()
    );

    let app = build_router(state);

    info!("Upload Relay listening on {}", addr);

    // Run the server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
