//! End-to-end tests for the secret gateway.
//!
//! Each test starts in-process mock servers for the managed identity endpoint
//! and the vault on ephemeral ports, then drives the real router over HTTP.
//!
//! Run with: cargo test --test gateway
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;

use podidentity::config::AppConfig;
use podidentity::identity::{IdentitySource, ManagedIdentityCredential};
use podidentity::{
    acquire_credential, create_router, AppState, IdentityError, SecretClient, TokenCredential,
};

const TEST_TOKEN: &str = "test-access-token";

/// Serve `app` on an ephemeral local port.
async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing is listening on.
async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

// =============================================================================
// Managed identity endpoint mock
// =============================================================================

#[derive(Clone)]
struct IdentityMock {
    calls: Arc<AtomicUsize>,
    last_query: Arc<Mutex<HashMap<String, String>>>,
    status: StatusCode,
    expires_in: i64,
    /// Successful responses served before every request fails
    fail_after: Option<usize>,
}

impl IdentityMock {
    fn new(status: StatusCode, expires_in: i64) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            last_query: Arc::new(Mutex::new(HashMap::new())),
            status,
            expires_in,
            fail_after: None,
        }
    }

    fn failing_after(mut self, successes: usize) -> Self {
        self.fail_after = Some(successes);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/metadata/identity/oauth2/token", get(identity_token))
            .with_state(self.clone());
        let addr = spawn(app).await;
        format!("http://{}/metadata/identity/oauth2/token", addr)
    }
}

async fn identity_token(
    State(mock): State<IdentityMock>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let call = mock.calls.fetch_add(1, Ordering::SeqCst) + 1;
    *mock.last_query.lock().unwrap() = query.clone();

    if headers.get("metadata").and_then(|v| v.to_str().ok()) != Some("true") {
        return (StatusCode::BAD_REQUEST, "Required metadata header not specified").into_response();
    }
    if mock.fail_after.is_some_and(|successes| call > successes) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "identity endpoint unavailable").into_response();
    }
    if mock.status != StatusCode::OK {
        return (
            mock.status,
            r#"{"error":"invalid_request","error_description":"Identity not found"}"#,
        )
            .into_response();
    }

    let expires_on = Utc::now().timestamp() + mock.expires_in;
    Json(serde_json::json!({
        "access_token": TEST_TOKEN,
        "expires_in": mock.expires_in.to_string(),
        "expires_on": expires_on.to_string(),
        "resource": query.get("resource"),
        "token_type": "Bearer",
    }))
    .into_response()
}

// =============================================================================
// Vault mock
// =============================================================================

#[derive(Clone, Default)]
struct VaultMock {
    secrets: Arc<RwLock<HashMap<String, String>>>,
    calls: Arc<AtomicUsize>,
}

impl VaultMock {
    fn set(&self, name: &str, value: &str) {
        self.secrets
            .write()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/secrets/{name}", get(vault_latest))
            .route("/secrets/{name}/{version}", get(vault_version))
            .with_state(self.clone());
        format!("http://{}", spawn(app).await)
    }

    fn lookup(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        name: &str,
        version: Option<&str>,
    ) -> Response {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let expected = format!("Bearer {}", TEST_TOKEN);
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, vault_error("Unauthorized", "missing bearer token"))
                .into_response();
        }
        if query.get("api-version").map(String::as_str) != Some("7.4") {
            return (StatusCode::BAD_REQUEST, vault_error("BadParameter", "api-version"))
                .into_response();
        }
        if name.starts_with("locked") {
            return (StatusCode::FORBIDDEN, vault_error("Forbidden", "secrets/get denied"))
                .into_response();
        }

        let key = match version {
            Some(version) => format!("{}@{}", name, version),
            None => name.to_string(),
        };
        match self.secrets.read().unwrap().get(&key) {
            Some(value) => Json(serde_json::json!({
                "value": value,
                "id": format!("https://vault.test/secrets/{}/{}", name, version.unwrap_or("v1")),
                "attributes": {"enabled": true},
            }))
            .into_response(),
            None => (
                StatusCode::NOT_FOUND,
                vault_error("SecretNotFound", "A secret with this name was not found"),
            )
                .into_response(),
        }
    }
}

/// A vault that answers only after `delay`.
async fn spawn_slow_vault(delay: Duration) -> String {
    let app = Router::new().route(
        "/secrets/{name}",
        get(move || async move {
            tokio::time::sleep(delay).await;
            Json(serde_json::json!({"value": "too late"}))
        }),
    );
    format!("http://{}", spawn(app).await)
}

fn vault_error(code: &str, message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": {"code": code, "message": message}}))
}

async fn vault_latest(
    State(vault): State<VaultMock>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    vault.lookup(&headers, &query, &name, None)
}

async fn vault_version(
    State(vault): State<VaultMock>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    vault.lookup(&headers, &query, &name, Some(&version))
}

// =============================================================================
// Gateway harness
// =============================================================================

fn test_config(identity_endpoint: &str, vault_url: &str, client_id: Option<&str>) -> AppConfig {
    let mut toml = format!(
        "[keyvault]\nurl = \"{}\"\ntimeout_seconds = 5\n[identity]\nendpoint = \"{}\"\ntimeout_seconds = 2\n",
        vault_url, identity_endpoint
    );
    if let Some(client_id) = client_id {
        toml.push_str(&format!("client_id = \"{}\"\n", client_id));
    }
    let config = AppConfig::parse(&toml).unwrap().with_overrides(|_| None);
    config.validate().unwrap();
    config
}

struct Gateway {
    base: String,
    vault: VaultMock,
    identity: IdentityMock,
    http: reqwest::Client,
}

impl Gateway {
    async fn start() -> Self {
        let identity = IdentityMock::new(StatusCode::OK, 3600);
        let vault = VaultMock::default();
        let vault_url = vault.spawn().await;
        Self::start_with(identity, vault, &vault_url).await
    }

    async fn start_with(identity: IdentityMock, vault: VaultMock, vault_url: &str) -> Self {
        Self::start_with_timeout(identity, vault, vault_url, 5).await
    }

    async fn start_with_timeout(
        identity: IdentityMock,
        vault: VaultMock,
        vault_url: &str,
        vault_timeout_secs: u64,
    ) -> Self {
        let identity_endpoint = identity.spawn().await;
        let mut config = test_config(&identity_endpoint, vault_url, None);
        config.keyvault.timeout_seconds = vault_timeout_secs;

        let credential = acquire_credential(&config.identity).await.unwrap();
        let secrets = SecretClient::from_config(&config.keyvault, credential).unwrap();
        let addr = spawn(create_router(AppState::new(secrets))).await;

        Self {
            base: format!("http://{}", addr),
            vault,
            identity,
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }

    async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let response = self.get(path).await;
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        (status, response.text().await.unwrap())
    }
}

fn parse_ping(body: &str) -> DateTime<chrono::FixedOffset> {
    let stamp = body
        .strip_prefix("Hello, World @")
        .and_then(|rest| rest.strip_suffix('!'))
        .unwrap_or_else(|| panic!("unexpected ping body: {}", body));
    DateTime::parse_from_rfc3339(stamp).unwrap()
}

// =============================================================================
// Liveness
// =============================================================================

#[tokio::test]
async fn ping_returns_greeting_with_timestamp() {
    let gateway = Gateway::start().await;

    let response = gateway.get("/ping").await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-cache"
    );
    assert!(response.headers().contains_key("x-request-id"));
    let first = parse_ping(&response.text().await.unwrap());

    let (_, body) = gateway.get_text("/ping").await;
    let second = parse_ping(&body);
    assert!(second >= first);
    assert_eq!(gateway.vault.calls(), 0);
}

// =============================================================================
// Secret lookups
// =============================================================================

#[tokio::test]
async fn secret_value_is_returned_verbatim() {
    let gateway = Gateway::start().await;
    let value = "  p@ss w0rd\n\tline two \u{e9}  ";
    gateway.vault.set("db-password", value);

    let response = gateway.get("/secret/db-password").await;
    assert_eq!(response.status().as_u16(), 200);
    let headers = response.headers().clone();
    assert!(headers
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(headers.get("cache-control").unwrap(), "no-store");
    assert_eq!(response.bytes().await.unwrap().as_ref(), value.as_bytes());
}

#[tokio::test]
async fn missing_secret_is_not_found() {
    let gateway = Gateway::start().await;

    let (status, body) = gateway.get_text("/secret/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "secret not found: nope");
}

#[tokio::test]
async fn lookups_are_not_cached() {
    let gateway = Gateway::start().await;
    gateway.vault.set("api-key", "first");

    assert_eq!(gateway.get_text("/secret/api-key").await.1, "first");
    gateway.vault.set("api-key", "second");
    assert_eq!(gateway.get_text("/secret/api-key").await.1, "second");
    assert_eq!(gateway.get_text("/secret/api-key").await.1, "second");

    assert_eq!(gateway.vault.calls(), 3);
}

#[tokio::test]
async fn concurrent_lookups_are_independent() {
    let gateway = Gateway::start().await;
    gateway.vault.set("alpha", "value-a");
    gateway.vault.set("beta", "value-b");

    for _ in 0..10 {
        let (a, b) = tokio::join!(
            gateway.get_text("/secret/alpha"),
            gateway.get_text("/secret/beta")
        );
        assert_eq!(a, (StatusCode::OK, "value-a".to_string()));
        assert_eq!(b, (StatusCode::OK, "value-b".to_string()));
    }
}

#[tokio::test]
async fn specific_version_is_returned() {
    let gateway = Gateway::start().await;
    gateway.vault.set("cert", "current");
    gateway.vault.set("cert@0a1b2c", "older");

    assert_eq!(gateway.get_text("/secret/cert").await.1, "current");
    assert_eq!(gateway.get_text("/secret/cert/0a1b2c").await.1, "older");

    let (status, _) = gateway.get_text("/secret/cert/ffff").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn encoded_names_stay_one_segment() {
    let gateway = Gateway::start().await;
    gateway.vault.set("with space", "spaced");
    gateway.vault.set("a/b", "slashed");

    assert_eq!(gateway.get_text("/secret/with%20space").await.1, "spaced");
    assert_eq!(gateway.get_text("/secret/a%2Fb").await.1, "slashed");
}

#[tokio::test]
async fn vault_denial_is_bad_gateway() {
    let gateway = Gateway::start().await;

    let response = gateway.get("/secret/locked-secret").await;
    assert_eq!(response.status().as_u16(), 502);
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");
    assert_eq!(
        response.text().await.unwrap(),
        "secret store rejected the request"
    );
}

#[tokio::test]
async fn unreachable_vault_is_bad_gateway() {
    let vault_url = format!("http://{}", closed_addr().await);
    let gateway = Gateway::start_with(
        IdentityMock::new(StatusCode::OK, 3600),
        VaultMock::default(),
        &vault_url,
    )
    .await;

    let (status, body) = gateway.get_text("/secret/anything").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, "secret store unavailable");
}

#[tokio::test]
async fn slow_vault_is_gateway_timeout() {
    let vault_url = spawn_slow_vault(Duration::from_secs(3)).await;
    let gateway = Gateway::start_with_timeout(
        IdentityMock::new(StatusCode::OK, 3600),
        VaultMock::default(),
        &vault_url,
        1,
    )
    .await;

    let response = gateway.get("/secret/anything").await;
    assert_eq!(response.status().as_u16(), 504);
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-store");
    assert_eq!(response.text().await.unwrap(), "secret store timed out");
}

#[tokio::test]
async fn failed_token_refresh_is_service_unavailable() {
    // Short lifetime forces a refresh on every lookup; only the startup request succeeds
    let identity = IdentityMock::new(StatusCode::OK, 60).failing_after(1);
    let vault = VaultMock::default();
    vault.set("x", "value");
    let vault_url = vault.spawn().await;
    let gateway = Gateway::start_with(identity, vault, &vault_url).await;

    let (status, body) = gateway.get_text("/secret/x").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "identity unavailable");
    assert_eq!(gateway.identity.calls(), 2);
    assert_eq!(gateway.vault.calls(), 0);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let gateway = Gateway::start().await;

    let (status, _) = gateway.get_text("/secret/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(gateway.vault.calls(), 0);
}

// =============================================================================
// Credential
// =============================================================================

#[tokio::test]
async fn credential_token_is_reused() {
    let gateway = Gateway::start().await;
    gateway.vault.set("s", "v");

    for _ in 0..5 {
        assert_eq!(gateway.get_text("/secret/s").await.0, StatusCode::OK);
    }
    // One request at startup, none afterwards
    assert_eq!(gateway.identity.calls(), 1);
}

#[tokio::test]
async fn expiring_token_is_refreshed() {
    // Shorter than the refresh margin, so every call refreshes
    let identity = IdentityMock::new(StatusCode::OK, 60);
    let endpoint = identity.spawn().await;
    let config = test_config(&endpoint, "http://vault.test", None);

    let credential = ManagedIdentityCredential::new(
        &config.identity,
        IdentitySource::Imds { endpoint },
    )
    .unwrap();
    credential.get_token().await.unwrap();
    credential.get_token().await.unwrap();
    assert_eq!(identity.calls(), 2);
}

#[tokio::test]
async fn token_request_carries_resource_and_client_id() {
    let identity = IdentityMock::new(StatusCode::OK, 3600);
    let endpoint = identity.spawn().await;
    let config = test_config(&endpoint, "http://vault.test", Some("11111111-2222"));

    let token = acquire_credential(&config.identity)
        .await
        .unwrap()
        .get_token()
        .await
        .unwrap();
    assert_eq!(token.token, TEST_TOKEN);

    let query = identity.last_query.lock().unwrap().clone();
    assert_eq!(query.get("api-version").unwrap(), "2018-02-01");
    assert_eq!(query.get("resource").unwrap(), "https://vault.azure.net");
    assert_eq!(query.get("client_id").unwrap(), "11111111-2222");
}

#[tokio::test]
async fn startup_fails_without_assigned_identity() {
    let identity = IdentityMock::new(StatusCode::BAD_REQUEST, 3600);
    let endpoint = identity.spawn().await;
    let config = test_config(&endpoint, "http://vault.test", None);

    match acquire_credential(&config.identity).await {
        Err(IdentityError::Rejected { status, body }) => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("Identity not found"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("credential acquired without an identity"),
    }
}

#[tokio::test]
async fn startup_fails_when_identity_endpoint_unreachable() {
    let endpoint = format!(
        "http://{}/metadata/identity/oauth2/token",
        closed_addr().await
    );
    let config = test_config(&endpoint, "http://vault.test", None);

    assert!(matches!(
        acquire_credential(&config.identity).await,
        Err(IdentityError::Unreachable(_))
    ));
}
