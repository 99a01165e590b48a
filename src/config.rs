//! Configuration loading and constants.
//!
//! Loads application configuration from a TOML file, applies environment
//! overrides and validates the result. `AppConfig` is the root configuration
//! struct; the vault URL it carries is fixed for the lifetime of the process.

use const_format::formatcp;
use serde::Deserialize;
use std::path::Path;

// =============================================================================
// HTTP Response Cache Control
// =============================================================================

/// Liveness responses carry a fresh timestamp every time
pub const CACHE_CONTROL_PING: &str = "no-cache";

/// Secret values must never be stored by intermediaries
pub const CACHE_CONTROL_SECRET: &str = "no-store";

// =============================================================================
// Managed Identity Constants
// =============================================================================

/// Azure Instance Metadata Service host
pub const IMDS_HOST: &str = "http://169.254.169.254";

/// Token path on the metadata service
pub const IMDS_TOKEN_PATH: &str = "/metadata/identity/oauth2/token";

/// Default managed identity token endpoint
pub const IMDS_TOKEN_ENDPOINT: &str = formatcp!("{}{}", IMDS_HOST, IMDS_TOKEN_PATH);

/// API version understood by IMDS and pod identity NMI
pub const IMDS_API_VERSION: &str = "2018-02-01";

/// API version of the App Service identity endpoint
pub const APP_SERVICE_API_VERSION: &str = "2019-08-01";

/// Environment variables injected by App Service / Functions
pub const ENV_IDENTITY_ENDPOINT: &str = "IDENTITY_ENDPOINT";
pub const ENV_IDENTITY_HEADER: &str = "IDENTITY_HEADER";

/// Resource (audience) for Key Vault tokens
pub const DEFAULT_VAULT_RESOURCE: &str = "https://vault.azure.net";

/// Refresh a cached token when less than this many seconds remain
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Lifetime assumed when the token endpoint reports none
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

// =============================================================================
// Key Vault Constants
// =============================================================================

pub const DEFAULT_KEYVAULT_API_VERSION: &str = "7.4";

/// Environment override for the vault URL
pub const ENV_KEYVAULT_URL: &str = "KEYVAULT_URL";

/// Environment override for a user-assigned identity
pub const ENV_AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";

pub const USER_AGENT: &str = formatcp!(
    "{}/{}",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_VERSION")
);

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "podidentity=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub http: HttpServerConfig,
    /// Secret store settings
    #[serde(default)]
    pub keyvault: KeyVaultConfig,
    /// Managed identity settings
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "HttpServerConfig::default_host")]
    pub host: String,
    #[serde(default = "HttpServerConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            tls: TlsConfig::default(),
        }
    }
}

impl HttpServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        8080
    }
}

/// How the listener terminates TLS
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain HTTP, TLS handled by an ingress or sidecar
    #[default]
    None,
    /// Certificate and key files on disk, reloaded on SIGHUP
    Manual,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Key Vault connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct KeyVaultConfig {
    /// Vault base URL, e.g. `https://myvault.vault.azure.net`
    #[serde(default)]
    pub url: String,
    #[serde(default = "KeyVaultConfig::default_api_version")]
    pub api_version: String,
    /// Timeout for a single secret lookup
    #[serde(default = "KeyVaultConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_version: Self::default_api_version(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl KeyVaultConfig {
    fn default_api_version() -> String {
        DEFAULT_KEYVAULT_API_VERSION.to_string()
    }

    fn default_timeout() -> u64 {
        30
    }
}

/// Managed identity settings
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Audience the token is requested for
    #[serde(default = "IdentityConfig::default_resource")]
    pub resource: String,
    /// Client ID of a user-assigned identity (system-assigned when absent)
    pub client_id: Option<String>,
    /// Explicit IMDS-compatible token endpoint (pod identity NMI, emulators)
    pub endpoint: Option<String>,
    #[serde(default = "IdentityConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            resource: Self::default_resource(),
            client_id: None,
            endpoint: None,
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl IdentityConfig {
    fn default_resource() -> String {
        DEFAULT_VAULT_RESOURCE.to_string()
    }

    fn default_timeout() -> u64 {
        10
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    /// Load configuration from `path`, then apply environment overrides.
    ///
    /// When `required` is false a missing file yields the defaults, so the
    /// service can be configured from the environment alone.
    pub fn load<P: AsRef<Path>>(path: P, required: bool) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if !required && !path.exists() {
            AppConfig::default()
        } else {
            let contents = std::fs::read_to_string(path)?;
            Self::parse(&contents)?
        };

        let config = config.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_KEYVAULT_URL).filter(|v| !v.trim().is_empty()) {
            self.keyvault.url = url;
        }
        if self.identity.client_id.is_none() {
            self.identity.client_id = lookup(ENV_AZURE_CLIENT_ID).filter(|v| !v.trim().is_empty());
        }
        self.keyvault.url = self.keyvault.url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keyvault.url.is_empty() {
            return Err(ConfigError::Validation(format!(
                "No vault URL configured. Set keyvault.url or {}",
                ENV_KEYVAULT_URL
            )));
        }

        let url = reqwest::Url::parse(&self.keyvault.url).map_err(|e| {
            ConfigError::Validation(format!("Invalid keyvault.url '{}': {}", self.keyvault.url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "keyvault.url must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.http.tls.mode == TlsMode::Manual
            && (self.http.tls.cert_path.is_none() || self.http.tls.key_path.is_none())
        {
            return Err(ConfigError::Validation(
                "TLS mode 'manual' requires http.tls.cert_path and http.tls.key_path".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
