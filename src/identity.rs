//! Managed identity credential.
//!
//! Obtains bearer tokens from the hosting platform's identity endpoint so the
//! service never handles static credentials. Two wire protocols are spoken:
//! - **IMDS**: the VM / pod-local metadata service (also used by the pod
//!   identity NMI and by emulators), selected by default or by an explicit
//!   `identity.endpoint`
//! - **App Service**: selected when `IDENTITY_ENDPOINT` and `IDENTITY_HEADER`
//!   are present in the environment
//!
//! The credential caches its token and refreshes it shortly before expiry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;

use crate::config::{
    IdentityConfig, APP_SERVICE_API_VERSION, DEFAULT_TOKEN_LIFETIME_SECS, ENV_IDENTITY_ENDPOINT,
    ENV_IDENTITY_HEADER, IMDS_API_VERSION, IMDS_TOKEN_ENDPOINT, TOKEN_REFRESH_MARGIN_SECS,
    USER_AGENT,
};

/// Error type for token acquisition
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Managed identity endpoint unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("Managed identity endpoint rejected the token request: {status} {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Failed to parse token response: {0}")]
    Parse(String),

    #[error("Failed to build identity HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// A bearer token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    /// True while the token has more than the refresh margin left at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on
            .checked_sub_signed(chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS))
            .is_some_and(|refresh_at| refresh_at > now)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of bearer tokens for outbound calls.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Returns a token valid for the configured resource.
    async fn get_token(&self) -> Result<AccessToken, IdentityError>;
}

/// Where tokens are requested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    Imds { endpoint: String },
    AppService { endpoint: String, header: String },
}

impl IdentitySource {
    /// Pick the token endpoint: explicit config first, then the App Service
    /// environment, then the instance metadata service.
    pub fn resolve<F>(config: &IdentityConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = config.endpoint.as_ref().filter(|e| !e.trim().is_empty()) {
            return IdentitySource::Imds {
                endpoint: endpoint.trim().to_string(),
            };
        }

        if let (Some(endpoint), Some(header)) =
            (lookup(ENV_IDENTITY_ENDPOINT), lookup(ENV_IDENTITY_HEADER))
        {
            return IdentitySource::AppService { endpoint, header };
        }

        IdentitySource::Imds {
            endpoint: IMDS_TOKEN_ENDPOINT.to_string(),
        }
    }

    fn endpoint(&self) -> &str {
        match self {
            IdentitySource::Imds { endpoint } | IdentitySource::AppService { endpoint, .. } => {
                endpoint
            }
        }
    }

    fn api_version(&self) -> &'static str {
        match self {
            IdentitySource::Imds { .. } => IMDS_API_VERSION,
            IdentitySource::AppService { .. } => APP_SERVICE_API_VERSION,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            IdentitySource::Imds { .. } => "imds",
            IdentitySource::AppService { .. } => "app_service",
        }
    }
}

/// Token credential backed by the platform's managed identity.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    source: IdentitySource,
    resource: String,
    client_id: Option<String>,
    cache: Mutex<Option<AccessToken>>,
}

impl ManagedIdentityCredential {
    pub fn new(config: &IdentityConfig, source: IdentitySource) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(USER_AGENT)
            .build()
            .map_err(IdentityError::Client)?;

        Ok(Self {
            http,
            source,
            resource: config.resource.clone(),
            client_id: config.client_id.clone(),
            cache: Mutex::new(None),
        })
    }

    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    async fn request_token(&self) -> Result<AccessToken, IdentityError> {
        let mut request = self.http.get(self.source.endpoint()).query(&[
            ("api-version", self.source.api_version()),
            ("resource", self.resource.as_str()),
        ]);
        if let Some(client_id) = &self.client_id {
            request = request.query(&[("client_id", client_id.as_str())]);
        }
        request = match &self.source {
            IdentitySource::Imds { .. } => request.header("Metadata", "true"),
            IdentitySource::AppService { header, .. } => {
                request.header("X-IDENTITY-HEADER", header.as_str())
            }
        };

        let response = request.send().await.map_err(IdentityError::Unreachable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Rejected { status, body });
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Parse(e.to_string()))?;
        payload.into_access_token(Utc::now())
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self) -> Result<AccessToken, IdentityError> {
        // Held across the refresh so concurrent callers wait for one request
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.clone());
            }
        }

        tracing::debug!(source = self.source.kind(), "Requesting managed identity token");
        let token = self.request_token().await?;
        tracing::debug!(expires_on = %token.expires_on, "Managed identity token acquired");
        *cache = Some(token.clone());
        Ok(token)
    }
}

/// Acquire the process-wide credential.
///
/// Requests a first token so that a missing identity fails startup instead of
/// every later request.
pub async fn acquire_credential(
    config: &IdentityConfig,
) -> Result<Arc<dyn TokenCredential>, IdentityError> {
    let source = IdentitySource::resolve(config, |key| std::env::var(key).ok());
    tracing::info!(
        source = source.kind(),
        endpoint = %source.endpoint(),
        resource = %config.resource,
        user_assigned = config.client_id.is_some(),
        "Acquiring managed identity credential"
    );

    let credential = ManagedIdentityCredential::new(config, source)?;
    let token = credential.get_token().await?;
    tracing::info!(expires_on = %token.expires_on, "Managed identity credential ready");

    Ok(Arc::new(credential))
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<i64>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_on: Option<i64>,
}

impl TokenResponse {
    fn into_access_token(self, now: DateTime<Utc>) -> Result<AccessToken, IdentityError> {
        if self.access_token.is_empty() {
            return Err(IdentityError::Parse("empty access_token".to_string()));
        }

        let from_epoch = self
            .expires_on
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
        let expires_on = match (from_epoch, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => lifetime_from(now, secs)?,
            (None, None) => lifetime_from(now, DEFAULT_TOKEN_LIFETIME_SECS)?,
        };

        Ok(AccessToken {
            token: self.access_token,
            expires_on,
        })
    }
}

/// `now + secs`, rejecting lifetimes that are not positive or overflow.
fn lifetime_from(now: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>, IdentityError> {
    if secs <= 0 {
        return Err(IdentityError::Parse(format!(
            "expires_in must be positive, got {}",
            secs
        )));
    }
    chrono::Duration::try_seconds(secs)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| IdentityError::Parse(format!("expires_in out of range: {}", secs)))
}

/// IMDS reports lifetimes as numeric strings, other endpoints as numbers.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
