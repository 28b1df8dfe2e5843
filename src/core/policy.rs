use std::path::PathBuf;

use crate::config::models::ListenerConfig;

/// How the public listener terminates connections.
///
/// Decided once at startup by [`select_policy`]; everything downstream
/// (listeners, cookie flags, response headers) keys off the chosen variant
/// instead of re-reading the raw config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerPolicy {
    /// Plaintext HTTP on the configured address
    Disabled,
    /// TLS with operator-provided certificates, plus a port-80 listener
    /// answering 301 redirects to https
    AutoRedirect { cert: PathBuf, key: PathBuf },
    /// TLS with operator-provided certificates only
    ExplicitCert { cert: PathBuf, key: PathBuf },
    /// TLS with ACME-issued certificates for `host`. Always carries the
    /// port-80 redirect, since the challenge flow expects port 80 reachable.
    AutocertAcme {
        host: String,
        cache_dir: PathBuf,
        contact_email: Option<String>,
        staging: bool,
    },
}

impl ListenerPolicy {
    /// Whether connections on the primary listener are TLS-terminated.
    pub fn tls_active(&self) -> bool {
        !matches!(self, ListenerPolicy::Disabled)
    }

    /// Whether a port-80 redirect listener accompanies the primary one.
    pub fn redirects_port_80(&self) -> bool {
        matches!(
            self,
            ListenerPolicy::AutoRedirect { .. } | ListenerPolicy::AutocertAcme { .. }
        )
    }

    /// Stable name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            ListenerPolicy::Disabled => "disabled",
            ListenerPolicy::AutoRedirect { .. } => "auto_redirect",
            ListenerPolicy::ExplicitCert { .. } => "explicit_cert",
            ListenerPolicy::AutocertAcme { .. } => "autocert_acme",
        }
    }
}

/// Decide the listener policy from static configuration.
///
/// Precedence: `tls_disable` wins over everything, then an operator-provided
/// certificate pair (with or without the redirect listener), then ACME.
/// A half-configured cert pair never reaches this point in a running service,
/// validation rejects it; as a total function it falls through to ACME.
pub fn select_policy(listener: &ListenerConfig) -> ListenerPolicy {
    if listener.tls_disable {
        return ListenerPolicy::Disabled;
    }

    if let (Some(cert), Some(key)) = (&listener.tls_cert_file, &listener.tls_key_file) {
        if listener.tls_autoredirect {
            return ListenerPolicy::AutoRedirect {
                cert: cert.clone(),
                key: key.clone(),
            };
        }
        return ListenerPolicy::ExplicitCert {
            cert: cert.clone(),
            key: key.clone(),
        };
    }

    ListenerPolicy::AutocertAcme {
        host: listener.address.clone(),
        cache_dir: listener.tls_acme_cache.clone(),
        contact_email: listener.tls_acme_email.clone(),
        staging: listener.tls_acme_staging,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> ListenerConfig {
        ListenerConfig::default()
    }

    #[test]
    fn test_tls_disable_wins_over_everything() {
        let mut config = listener();
        config.tls_disable = true;
        config.tls_autoredirect = true;
        config.tls_cert_file = Some(PathBuf::from("/etc/ssl/cert.pem"));
        config.tls_key_file = Some(PathBuf::from("/etc/ssl/key.pem"));

        let policy = select_policy(&config);
        assert_eq!(policy, ListenerPolicy::Disabled);
        assert!(!policy.tls_active());
        assert!(!policy.redirects_port_80());
    }

    #[test]
    fn test_cert_pair_selects_explicit_cert() {
        let mut config = listener();
        config.tls_cert_file = Some(PathBuf::from("/etc/ssl/cert.pem"));
        config.tls_key_file = Some(PathBuf::from("/etc/ssl/key.pem"));

        let policy = select_policy(&config);
        assert_eq!(
            policy,
            ListenerPolicy::ExplicitCert {
                cert: PathBuf::from("/etc/ssl/cert.pem"),
                key: PathBuf::from("/etc/ssl/key.pem"),
            }
        );
        assert!(policy.tls_active());
        assert!(!policy.redirects_port_80());
    }

    #[test]
    fn test_autoredirect_needs_cert_pair() {
        let mut config = listener();
        config.tls_autoredirect = true;
        config.tls_cert_file = Some(PathBuf::from("/etc/ssl/cert.pem"));
        config.tls_key_file = Some(PathBuf::from("/etc/ssl/key.pem"));

        let policy = select_policy(&config);
        assert!(matches!(policy, ListenerPolicy::AutoRedirect { .. }));
        assert!(policy.redirects_port_80());
    }

    #[test]
    fn test_no_certs_selects_acme() {
        let mut config = listener();
        config.address = "vault.example.com".to_string();
        config.tls_acme_email = Some("ops@example.com".to_string());

        let policy = select_policy(&config);
        match policy {
            ListenerPolicy::AutocertAcme {
                ref host,
                ref contact_email,
                staging,
                ..
            } => {
                assert_eq!(host, "vault.example.com");
                assert_eq!(contact_email.as_deref(), Some("ops@example.com"));
                assert!(!staging);
            }
            other => panic!("expected ACME policy, got {other:?}"),
        }
        assert!(policy.redirects_port_80());
    }

    #[test]
    fn test_autoredirect_flag_alone_still_selects_acme() {
        let mut config = listener();
        config.address = "vault.example.com".to_string();
        config.tls_autoredirect = true;

        assert!(matches!(
            select_policy(&config),
            ListenerPolicy::AutocertAcme { .. }
        ));
    }

    #[test]
    fn test_policy_names_are_stable() {
        let mut config = listener();
        config.tls_disable = true;
        assert_eq!(select_policy(&config).name(), "disabled");

        config.tls_disable = false;
        assert_eq!(select_policy(&config).name(), "autocert_acme");
    }
}
