use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::vault::VaultError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Secret lookup failed: {0}")]
    Vault(#[from] VaultError),
}

impl AppError {
    /// Status code and client-facing message. Upstream details stay in the log.
    pub fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::Vault(VaultError::NotFound { name }) => {
                (StatusCode::NOT_FOUND, format!("secret not found: {}", name))
            }
            AppError::Vault(VaultError::Forbidden { .. }) => (
                StatusCode::BAD_GATEWAY,
                "secret store rejected the request".to_string(),
            ),
            AppError::Vault(VaultError::Timeout(_)) => (
                StatusCode::GATEWAY_TIMEOUT,
                "secret store timed out".to_string(),
            ),
            AppError::Vault(VaultError::Transport(_)) => (
                StatusCode::BAD_GATEWAY,
                "secret store unavailable".to_string(),
            ),
            AppError::Vault(VaultError::Credential(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "identity unavailable".to_string(),
            ),
            AppError::Vault(
                VaultError::Upstream { .. } | VaultError::Decode(_) | VaultError::Client(_),
            ) => (StatusCode::BAD_GATEWAY, "secret store error".to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status == StatusCode::NOT_FOUND {
            tracing::info!(error = %self, "Secret lookup failed");
        } else {
            tracing::error!(error = %self, status = status.as_u16(), "Secret lookup failed");
        }

        (status, message).into_response()
    }
}
