//! Shared application state for request handlers.

use std::sync::Arc;

use crate::vault::SecretClient;

/// Shared application state, cloneable across handlers via Arc-wrapped fields.
///
/// Built once at startup; nothing in it is mutated afterwards.
#[derive(Clone)]
pub struct AppState {
    pub secrets: Arc<SecretClient>,
}

impl AppState {
    /// Creates a new application state around the process-wide secret client.
    pub fn new(secrets: SecretClient) -> Self {
        Self {
            secrets: Arc::new(secrets),
        }
    }
}
