//! Liveness probe.
//!
//! Returns a greeting stamped with the current server time. It does not touch
//! the vault or the credential, so it stays green while the secret store is down.

use chrono::{DateTime, SecondsFormat, Utc};

/// Liveness handler for `GET /ping`.
pub async fn ping() -> String {
    greeting(Utc::now())
}

/// Format the greeting for `now` as `Hello, World @<RFC 3339 UTC>!`.
pub fn greeting(now: DateTime<Utc>) -> String {
    format!(
        "Hello, World @{}!",
        now.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
}
