//! Graceful shutdown and signal handling.
//!
//! Handles:
//! - SIGTERM/SIGINT: Graceful shutdown with connection draining
//! - SIGHUP: Certificate reload (manual TLS mode only)

use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;

/// Time allowed for in-flight secret lookups to finish
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Resolves when the process receives Ctrl+C or SIGTERM.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}

/// Setup graceful shutdown on SIGTERM and SIGINT.
///
/// When either signal is received the server stops accepting connections and
/// waits up to the grace period for open ones to complete.
pub fn setup_shutdown_handler(handle: Handle) {
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        tracing::info!(signal, "Initiating graceful shutdown");

        handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
        tracing::info!(
            grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
            "Waiting for open connections to close"
        );
    });
}

/// Setup SIGHUP handler for certificate reload (manual TLS mode).
#[cfg(unix)]
pub fn setup_reload_handler(tls_config: RustlsConfig, cert_path: String, key_path: String) {
    tokio::spawn(async move {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

        while sighup.recv().await.is_some() {
            tracing::info!("Received SIGHUP, reloading TLS certificates");

            match tls_config.reload_from_pem_file(&cert_path, &key_path).await {
                Ok(()) => {
                    tracing::info!(cert = %cert_path, key = %key_path, "TLS certificates reloaded");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        cert = %cert_path,
                        key = %key_path,
                        "Failed to reload TLS certificates"
                    );
                }
            }
        }
    });
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub fn setup_reload_handler(_tls_config: RustlsConfig, _cert_path: String, _key_path: String) {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
}
