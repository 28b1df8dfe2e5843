use std::{cmp, fmt, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};

use crate::{
    config::models::VaultConfig,
    ports::backend::{AuthGrant, BackendClient, BackendResult},
};

/// Never renew more often than this, whatever the lease says.
const RENEW_FLOOR: Duration = Duration::from_secs(10);

/// Backoff after a failed renewal attempt.
const RENEW_RETRY: Duration = Duration::from_secs(30);

/// The startup credential, exactly one of two shapes.
///
/// Redacted in `Debug` and held only in memory; it is consumed by
/// [`Session::authenticate`] and gone once the session exists.
pub enum Credential {
    /// A single-use wrapped token to redeem for the session token
    WrappedToken(String),
    /// Role credentials for a direct login
    Approle { role_id: String, secret_id: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::WrappedToken(_) => f.write_str("Credential::WrappedToken(<redacted>)"),
            Credential::Approle { role_id, .. } => f
                .debug_struct("Credential::Approle")
                .field("role_id", role_id)
                .field("secret_id", &"<redacted>")
                .finish(),
        }
    }
}

/// Error selecting the startup credential
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("both a wrapped token and vault.approle_secret were provided; supply exactly one")]
    Ambiguous,
    #[error("no credential provided; supply a wrapped token (--token) or vault.approle_secret")]
    Missing,
}

impl Credential {
    /// Pick the credential from startup inputs. Empty strings count as
    /// absent, and exactly one source must remain.
    pub fn from_startup(
        wrapped_token: Option<String>,
        vault: &VaultConfig,
    ) -> Result<Self, CredentialError> {
        let wrapped = wrapped_token.filter(|t| !t.is_empty());
        let role_secret = vault.approle_secret.clone().filter(|s| !s.is_empty());

        match (wrapped, role_secret) {
            (Some(_), Some(_)) => Err(CredentialError::Ambiguous),
            (Some(token), None) => Ok(Credential::WrappedToken(token)),
            (None, Some(secret_id)) => Ok(Credential::Approle {
                role_id: vault.approle_id.clone(),
                secret_id,
            }),
            (None, None) => Err(CredentialError::Missing),
        }
    }
}

/// Lease terms of the session token, as last reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub duration: Duration,
    pub renewable: bool,
}

impl From<&AuthGrant> for Lease {
    fn from(grant: &AuthGrant) -> Self {
        Self {
            duration: Duration::from_secs(grant.lease_duration_secs),
            renewable: grant.renewable,
        }
    }
}

/// The service's authenticated identity against the backend.
///
/// The token itself never changes after login; renewals only refresh the
/// lease terms. Shared freely across tasks, lease reads are lock-free.
pub struct Session {
    token: String,
    lease: ArcSwap<Lease>,
}

impl Session {
    /// Exchange the startup credential for a session.
    ///
    /// The credential is consumed: a wrapped token is spent at the backend by
    /// the exchange (a replay of it will fail there), and role credentials
    /// are not needed again once the grant exists.
    pub async fn authenticate(
        client: &dyn BackendClient,
        login_path: &str,
        credential: Credential,
    ) -> BackendResult<Self> {
        let grant = match credential {
            Credential::WrappedToken(token) => client.unwrap_token(&token).await?,
            Credential::Approle { role_id, secret_id } => {
                client.approle_login(login_path, &role_id, &secret_id).await?
            }
        };
        Ok(Self::from_grant(grant))
    }

    pub fn from_grant(grant: AuthGrant) -> Self {
        let lease = Lease::from(&grant);
        Self {
            token: grant.client_token,
            lease: ArcSwap::from_pointee(lease),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Arc<Lease> {
        self.lease.load_full()
    }

    /// Refresh the lease terms from a renewal grant. The token is left alone.
    pub fn apply_grant(&self, grant: &AuthGrant) {
        self.lease.store(Arc::new(Lease::from(grant)));
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("lease", &self.lease.load())
            .finish()
    }
}

/// How long to wait before the next renewal: half the lease, floored.
fn renew_wait(lease: &Lease) -> Duration {
    cmp::max(lease.duration / 2, RENEW_FLOOR)
}

/// Keep the session lease alive in the background.
///
/// Renews at each half-life, backs off briefly on failure, and stops when
/// the shutdown broadcast fires. Renewal failures are warnings rather than
/// fatal: the token stays valid until its lease actually runs out.
pub fn spawn_renewal(
    session: Arc<Session>,
    client: Arc<dyn BackendClient>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut wait = renew_wait(&session.lease());
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("session renewal task stopping");
                    break;
                }
                _ = sleep(wait) => {}
            }

            match client.renew_self(session.token()).await {
                Ok(grant) => {
                    session.apply_grant(&grant);
                    wait = renew_wait(&session.lease());
                    tracing::debug!(
                        lease_secs = grant.lease_duration_secs,
                        "session lease renewed"
                    );
                }
                Err(e) => {
                    wait = RENEW_RETRY;
                    tracing::warn!(error = %e, "session renewal failed, retrying");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http::Method;
    use serde_json::Value;

    use super::*;
    use crate::ports::backend::{BackendError, RelayResponse};

    struct StubBackend;

    #[async_trait]
    impl BackendClient for StubBackend {
        async fn health(&self) -> BackendResult<Value> {
            unimplemented!()
        }

        async fn unwrap_token(&self, wrapping_token: &str) -> BackendResult<AuthGrant> {
            if wrapping_token == "good-wrap" {
                Ok(AuthGrant {
                    client_token: "s.session".to_string(),
                    lease_duration_secs: 3600,
                    renewable: true,
                })
            } else {
                Err(BackendError::CredentialRejected(
                    "wrapping token is not valid or does not exist".to_string(),
                ))
            }
        }

        async fn approle_login(
            &self,
            login_path: &str,
            role_id: &str,
            secret_id: &str,
        ) -> BackendResult<AuthGrant> {
            assert_eq!(login_path, "auth/approle/login");
            assert_eq!(role_id, "vaultgate");
            assert_eq!(secret_id, "role-secret");
            Ok(AuthGrant {
                client_token: "s.role-session".to_string(),
                lease_duration_secs: 1800,
                renewable: false,
            })
        }

        async fn renew_self(&self, _token: &str) -> BackendResult<AuthGrant> {
            unimplemented!()
        }

        async fn read_secret(&self, _token: &str, _path: &str) -> BackendResult<Value> {
            unimplemented!()
        }

        async fn relay(
            &self,
            _token: Option<&str>,
            _method: Method,
            _path: &str,
            _body: Option<Value>,
        ) -> BackendResult<RelayResponse> {
            unimplemented!()
        }
    }

    #[test]
    fn test_credential_requires_exactly_one_source() {
        let vault = VaultConfig::default();

        assert!(matches!(
            Credential::from_startup(None, &vault),
            Err(CredentialError::Missing)
        ));

        let mut with_secret = vault.clone();
        with_secret.approle_secret = Some("role-secret".to_string());
        assert!(matches!(
            Credential::from_startup(Some("wrap".to_string()), &with_secret),
            Err(CredentialError::Ambiguous)
        ));

        assert!(matches!(
            Credential::from_startup(Some("wrap".to_string()), &vault),
            Ok(Credential::WrappedToken(_))
        ));
        assert!(matches!(
            Credential::from_startup(None, &with_secret),
            Ok(Credential::Approle { .. })
        ));
    }

    #[test]
    fn test_empty_strings_count_as_absent() {
        let mut vault = VaultConfig::default();
        vault.approle_secret = Some("".to_string());

        assert!(matches!(
            Credential::from_startup(Some("".to_string()), &vault),
            Err(CredentialError::Missing)
        ));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let wrapped = Credential::WrappedToken("hvs.topsecret".to_string());
        assert!(!format!("{wrapped:?}").contains("topsecret"));

        let role = Credential::Approle {
            role_id: "vaultgate".to_string(),
            secret_id: "topsecret".to_string(),
        };
        let rendered = format!("{role:?}");
        assert!(rendered.contains("vaultgate"));
        assert!(!rendered.contains("topsecret"));
    }

    #[tokio::test]
    async fn test_authenticate_with_wrapped_token() {
        let session = Session::authenticate(
            &StubBackend,
            "auth/approle/login",
            Credential::WrappedToken("good-wrap".to_string()),
        )
        .await
        .unwrap();

        assert_eq!(session.token(), "s.session");
        let lease = session.lease();
        assert_eq!(lease.duration, Duration::from_secs(3600));
        assert!(lease.renewable);
    }

    #[tokio::test]
    async fn test_authenticate_with_bad_wrapped_token_fails() {
        let result = Session::authenticate(
            &StubBackend,
            "auth/approle/login",
            Credential::WrappedToken("stale-wrap".to_string()),
        )
        .await;
        assert!(matches!(result, Err(BackendError::CredentialRejected(_))));
    }

    #[tokio::test]
    async fn test_authenticate_with_approle() {
        let session = Session::authenticate(
            &StubBackend,
            "auth/approle/login",
            Credential::Approle {
                role_id: "vaultgate".to_string(),
                secret_id: "role-secret".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(session.token(), "s.role-session");
        assert!(!session.lease().renewable);
    }

    #[test]
    fn test_renew_wait_is_half_life_with_floor() {
        let lease = Lease {
            duration: Duration::from_secs(3600),
            renewable: true,
        };
        assert_eq!(renew_wait(&lease), Duration::from_secs(1800));

        let short = Lease {
            duration: Duration::from_secs(4),
            renewable: true,
        };
        assert_eq!(renew_wait(&short), RENEW_FLOOR);
    }

    #[test]
    fn test_apply_grant_updates_lease_not_token() {
        let session = Session::from_grant(AuthGrant {
            client_token: "s.session".to_string(),
            lease_duration_secs: 3600,
            renewable: true,
        });

        session.apply_grant(&AuthGrant {
            client_token: String::new(),
            lease_duration_secs: 7200,
            renewable: true,
        });

        assert_eq!(session.token(), "s.session");
        assert_eq!(session.lease().duration, Duration::from_secs(7200));
    }

    #[tokio::test]
    async fn test_renewal_task_stops_on_shutdown() {
        let session = Arc::new(Session::from_grant(AuthGrant {
            client_token: "s.session".to_string(),
            lease_duration_secs: 3600,
            renewable: true,
        }));
        let (tx, rx) = tokio::sync::broadcast::channel(1);

        let handle = spawn_renewal(session, Arc::new(StubBackend), rx);
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("renewal task should stop promptly")
            .unwrap();
    }

    #[test]
    fn test_session_debug_is_redacted() {
        let session = Session::from_grant(AuthGrant {
            client_token: "s.hushhush".to_string(),
            lease_duration_secs: 60,
            renewable: false,
        });
        assert!(!format!("{session:?}").contains("hushhush"));
    }
}
