//! HTTP server module with optional TLS.
//!
//! - **None (default)**: Plain HTTP, for use behind an ingress or sidecar
//! - **Manual**: User-provided certificate and key files, hot-reloaded via SIGHUP
//!
//! Both modes shut down gracefully on SIGTERM/SIGINT.

mod server;
mod shutdown;

pub use server::{listen_addr, start_server, ServerError};
