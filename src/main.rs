//! podidentity: a Key Vault gateway using managed identity.
//!
//! This is the application entry point. It loads configuration, initializes
//! tracing, acquires the managed identity credential, builds the secret client
//! and router, and starts the HTTP server. A credential failure aborts startup.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podidentity::config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use podidentity::http::start_server;
use podidentity::{acquire_credential, create_router, AppState, SecretClient};

/// podidentity: Serve Key Vault secrets using the platform's managed identity
#[derive(Parser, Debug)]
#[command(name = "podidentity", version, about)]
struct Args {
    /// Path to configuration file (optional; defaults and environment apply otherwise)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level filter (e.g., "podidentity=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<String>, logging: &LoggingConfig) {
    // Priority: CLI > env > default
    let log_filter = log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));

    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path, true)?,
        None => AppConfig::load(DEFAULT_CONFIG_PATH, false)?,
    };

    init_tracing(args.log_level, &config.logging);
    tracing::info!(
        vault = %config.keyvault.url,
        api_version = %config.keyvault.api_version,
        "Loaded configuration"
    );

    let credential = acquire_credential(&config.identity)
        .await
        .inspect_err(|e| {
            tracing::error!(error = %e, "No managed identity available, refusing to start")
        })?;

    let secrets = SecretClient::from_config(&config.keyvault, credential)?;
    tracing::info!(vault = %secrets.vault_url(), "Initialized secret client");

    let state = AppState::new(secrets);
    let app = create_router(state);

    start_server(app, &config).await?;

    Ok(())
}
