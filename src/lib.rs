//! podidentity: a plain-text HTTP gateway to Azure Key Vault secrets.
//!
//! The service authenticates with the hosting platform's managed identity,
//! so it holds no static credentials. `GET /secret/{name}` returns the
//! current value of a vault secret; `GET /ping` is a liveness probe.

pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod vault;

pub use error::AppError;
pub use identity::{acquire_credential, AccessToken, IdentityError, TokenCredential};
pub use routes::create_router;
pub use state::AppState;
pub use vault::{SecretBundle, SecretClient, VaultError};
