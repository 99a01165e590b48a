//! HTTP route table.
//!
//! `/ping` is the liveness probe; `/secret/...` forwards lookups to the vault.
//! Secret responses are marked `no-store` so intermediaries never keep a copy.
//!
//! Request tracing is enabled via middleware that generates a unique request ID
//! for each incoming request, allowing correlation of all logs within a request.

pub mod health;
pub mod secret;

use axum::{middleware, routing::get, Router};
use http::header::{HeaderValue, CACHE_CONTROL};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::{CACHE_CONTROL_PING, CACHE_CONTROL_SECRET};
use crate::middleware::request_id_layer;
use crate::state::AppState;

/// Creates the Axum router with all routes and cache headers.
pub fn create_router(state: AppState) -> Router {
    let ping_routes: Router<AppState> = Router::new().route("/ping", get(health::ping)).layer(
        SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_PING),
        ),
    );

    // Applies to error responses too
    let secret_routes: Router<AppState> = Router::new()
        .route("/secret/{name}", get(secret::get))
        .route("/secret/{name}/{version}", get(secret::get_version))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_SECRET),
        ));

    Router::new()
        .merge(ping_routes)
        .merge(secret_routes)
        .with_state(state)
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer))
}
