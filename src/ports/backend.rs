use std::fmt;

use async_trait::async_trait;
use http::Method;
use serde_json::Value;
use thiserror::Error;

/// Header carrying a backend token, identical on both sides of the relay:
/// browsers send their own token in it, and the service forwards tokens to
/// the backend under the same name.
pub const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// Custom error type for secrets-backend operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when the backend cannot be reached at all
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// Error when a backend request times out
    #[error("Backend timed out after {0} seconds")]
    Timeout(u64),

    /// Error when a request cannot be built (bad path, bad URL)
    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),

    /// Error when the backend rejects the presented credential
    #[error("Credential rejected by backend: {0}")]
    CredentialRejected(String),

    /// Error when the backend answers with an error status
    #[error("Backend returned status {status}: {message}")]
    Api {
        /// HTTP status code returned by the backend
        status: u16,
        /// Error messages extracted from the backend response
        message: String,
    },

    /// Error when the backend answers with a body we cannot interpret
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),
}

/// Result type alias for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A client token granted by the backend, together with its lease terms.
///
/// The token is the service credential for everything that follows, so the
/// `Debug` impl deliberately redacts it. Nothing here is ever written to disk.
#[derive(Clone)]
pub struct AuthGrant {
    /// The session token to present on subsequent backend requests
    pub client_token: String,
    /// How long the backend considers the token valid, in seconds
    pub lease_duration_secs: u64,
    /// Whether the token may be renewed before the lease runs out
    pub renewable: bool,
}

impl fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGrant")
            .field("client_token", &"<redacted>")
            .field("lease_duration_secs", &self.lease_duration_secs)
            .field("renewable", &self.renewable)
            .finish()
    }
}

/// A backend response relayed through the gateway without reinterpretation.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    /// Status code the backend answered with
    pub status: u16,
    /// JSON body the backend answered with, `null` if the body was empty
    pub body: Value,
}

/// BackendClient defines the port (interface) for talking to the secrets
/// backend that holds credentials, policies and runtime settings.
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Fetch the backend's health report.
    async fn health(&self) -> BackendResult<Value>;

    /// Redeem a single-use wrapped token for a session token.
    ///
    /// A second redemption of the same wrapped token must fail at the
    /// backend; callers treat that failure as a possible interception.
    async fn unwrap_token(&self, wrapping_token: &str) -> BackendResult<AuthGrant>;

    /// Log in with role credentials at the given auth mount path.
    async fn approle_login(
        &self,
        login_path: &str,
        role_id: &str,
        secret_id: &str,
    ) -> BackendResult<AuthGrant>;

    /// Renew the session token's lease.
    async fn renew_self(&self, token: &str) -> BackendResult<AuthGrant>;

    /// Read a secret at `path`, returning its `data` payload.
    async fn read_secret(&self, token: &str, path: &str) -> BackendResult<Value>;

    /// Forward an arbitrary API request and hand back whatever the backend
    /// said, status included. Protocol errors (unreachable, timeout) are
    /// still reported as `Err`.
    async fn relay(
        &self,
        token: Option<&str>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> BackendResult<RelayResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_grant_debug_redacts_token() {
        let grant = AuthGrant {
            client_token: "s.supersecret".to_string(),
            lease_duration_secs: 3600,
            renewable: true,
        };
        let rendered = format!("{grant:?}");
        assert!(!rendered.contains("supersecret"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("3600"));
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Api {
            status: 403,
            message: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Backend returned status 403: permission denied"
        );

        let err = BackendError::Timeout(15);
        assert_eq!(err.to_string(), "Backend timed out after 15 seconds");
    }
}
