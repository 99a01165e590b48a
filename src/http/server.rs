//! HTTP/HTTPS server startup logic.
//!
//! Supports two TLS modes:
//! - None: Plain HTTP (TLS terminated by an ingress or mesh sidecar)
//! - Manual: User-provided certificate files

use std::net::SocketAddr;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;

use crate::config::{AppConfig, TlsMode};

use super::shutdown;

/// Server startup error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid listen address: {0}")]
    Address(String),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Resolve `http.host` and `http.port` into a socket address.
pub fn listen_addr(config: &AppConfig) -> Result<SocketAddr, ServerError> {
    format!("{}:{}", config.http.host, config.http.port)
        .parse()
        .map_err(|e| ServerError::Address(format!("http.host/http.port: {}", e)))
}

/// Start the HTTP/HTTPS server based on configuration.
///
/// This function blocks until the server shuts down.
pub async fn start_server(app: Router, config: &AppConfig) -> Result<(), ServerError> {
    let addr = listen_addr(config)?;
    let handle = Handle::new();

    let tls = &config.http.tls;
    match (&tls.mode, &tls.cert_path, &tls.key_path) {
        (TlsMode::None, _, _) => start_plain_server(app, addr, handle).await,
        (TlsMode::Manual, Some(cert_path), Some(key_path)) => {
            start_manual_tls_server(app, addr, cert_path, key_path, handle).await
        }
        (TlsMode::Manual, _, _) => Err(ServerError::TlsConfig(
            "manual mode requires cert_path and key_path".to_string(),
        )),
    }
}

/// Start a plain HTTP server (no TLS).
async fn start_plain_server(
    app: Router,
    addr: SocketAddr,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, "Starting HTTP server (no TLS)");

    shutdown::setup_shutdown_handler(handle.clone());

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

/// Start HTTPS server with user-provided certificates.
async fn start_manual_tls_server(
    app: Router,
    addr: SocketAddr,
    cert_path: &str,
    key_path: &str,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, cert = %cert_path, key = %key_path, "Starting HTTPS server (manual certs)");

    // ring is linked too (via reqwest), so no provider is selected implicitly
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| ServerError::TlsConfig(format!("Failed to load certificates: {}", e)))?;

    shutdown::setup_shutdown_handler(handle.clone());
    shutdown::setup_reload_handler(
        rustls_config.clone(),
        cert_path.to_string(),
        key_path.to_string(),
    );

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
