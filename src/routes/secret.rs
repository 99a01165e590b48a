//! Secret lookup handlers.
//!
//! Each request performs one vault call; the stored value is returned as the
//! plain-text body without transformation.

use axum::extract::{Path, State};
use serde::Deserialize;
use tracing::instrument;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SecretPath {
    pub name: String,
}

#[derive(Deserialize)]
pub struct SecretVersionPath {
    pub name: String,
    pub version: String,
}

/// Returns the current value of a secret.
#[instrument(name = "secret::get", skip_all, fields(secret = %path.name))]
pub async fn get(
    State(state): State<AppState>,
    Path(path): Path<SecretPath>,
) -> Result<String, AppError> {
    let bundle = state.secrets.get_secret(&path.name).await?;
    tracing::debug!(version = bundle.version().unwrap_or("-"), "Secret retrieved");
    Ok(bundle.value)
}

/// Returns a specific version of a secret.
#[instrument(name = "secret::get_version", skip_all, fields(secret = %path.name, version = %path.version))]
pub async fn get_version(
    State(state): State<AppState>,
    Path(path): Path<SecretVersionPath>,
) -> Result<String, AppError> {
    let bundle = state
        .secrets
        .get_secret_version(&path.name, &path.version)
        .await?;
    tracing::debug!("Secret version retrieved");
    Ok(bundle.value)
}
