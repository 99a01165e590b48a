//! Key Vault secrets client.
//!
//! Issues one authenticated `GET {vault}/secrets/{name}[/{version}]` per
//! lookup. Nothing is cached: every call reflects the vault's current value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::{KeyVaultConfig, USER_AGENT};
use crate::identity::{IdentityError, TokenCredential};

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Secret not found: {name}")]
    NotFound { name: String },

    #[error("Secret store denied access ({status}): {message}")]
    Forbidden { status: StatusCode, message: String },

    #[error("Secret store returned {status}: {message}")]
    Upstream { status: StatusCode, message: String },

    #[error("Secret store request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("Secret store unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Failed to decode secret bundle: {0}")]
    Decode(String),

    #[error("Failed to obtain access token: {0}")]
    Credential(#[from] IdentityError),

    #[error("Failed to build vault HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl VaultError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VaultError::Timeout(err)
        } else {
            VaultError::Transport(err)
        }
    }
}

/// A secret as returned by the vault.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBundle {
    pub value: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub attributes: Option<SecretAttributes>,
}

impl SecretBundle {
    /// Version segment of the secret identifier.
    pub fn version(&self) -> Option<&str> {
        // {vault}/secrets/{name}/{version}
        let mut segments = self
            .id
            .as_deref()?
            .trim_end_matches('/')
            .split('/')
            .skip_while(|segment| *segment != "secrets")
            .skip(1);
        segments.next()?;
        segments.next().filter(|version| !version.is_empty())
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("value", &"<redacted>")
            .field("id", &self.id)
            .field("content_type", &self.content_type)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Lifecycle attributes; timestamps are Unix seconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretAttributes {
    pub enabled: Option<bool>,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    pub exp: Option<i64>,
    pub nbf: Option<i64>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Client bound to a single vault and credential for the process lifetime.
pub struct SecretClient {
    http: reqwest::Client,
    vault_url: String,
    api_version: String,
    credential: Arc<dyn TokenCredential>,
}

impl SecretClient {
    pub fn new(
        vault_url: &str,
        api_version: &str,
        timeout: Duration,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(VaultError::Client)?;

        Ok(Self {
            http,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            credential,
        })
    }

    pub fn from_config(
        config: &KeyVaultConfig,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, VaultError> {
        Self::new(
            &config.url,
            &config.api_version,
            Duration::from_secs(config.timeout_seconds),
            credential,
        )
    }

    pub fn vault_url(&self) -> &str {
        &self.vault_url
    }

    /// Fetch the current version of `name`.
    pub async fn get_secret(&self, name: &str) -> Result<SecretBundle, VaultError> {
        self.fetch(name, None).await
    }

    /// Fetch a specific version of `name`.
    pub async fn get_secret_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<SecretBundle, VaultError> {
        self.fetch(name, Some(version)).await
    }

    /// Build the lookup URL. Path inputs are percent-encoded so they stay a
    /// single segment under `/secrets/`.
    pub fn secret_url(&self, name: &str, version: Option<&str>) -> String {
        let mut url = format!("{}/secrets/{}", self.vault_url, urlencoding::encode(name));
        if let Some(version) = version {
            url.push('/');
            url.push_str(&urlencoding::encode(version));
        }
        url.push_str("?api-version=");
        url.push_str(&urlencoding::encode(&self.api_version));
        url
    }

    async fn fetch(&self, name: &str, version: Option<&str>) -> Result<SecretBundle, VaultError> {
        let token = self.credential.get_token().await?;
        let url = self.secret_url(name, version);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(VaultError::from_transport)?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(VaultError::from_transport)?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|e| VaultError::Decode(e.to_string()));
        }

        let message = error_message(&body);
        tracing::debug!(%status, %message, "Secret store returned an error");
        Err(match status {
            StatusCode::NOT_FOUND => VaultError::NotFound {
                name: name.to_string(),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                VaultError::Forbidden { status, message }
            }
            _ => VaultError::Upstream { status, message },
        })
    }
}

/// Render a vault error body as `code: message`, falling back to raw text.
fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error }) => match (error.code, error.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => String::new(),
        },
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}
