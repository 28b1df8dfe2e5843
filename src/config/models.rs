//! Configuration data structures for Vaultgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde-friendly and include defaults so that minimal configs remain
//! concise: an empty file yields a TLS-expecting listener on localhost talking to a
//! backend on `127.0.0.1:8200`.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level service configuration.
///
/// Everything here is fixed for the lifetime of the process. Settings that may
/// change while running live in the backend instead, see
/// [`crate::core::runtime::RuntimeConfig`].
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener and TLS settings
    pub listener: ListenerConfig,
    /// Secrets backend connection settings
    pub vault: VaultConfig,
}

/// Configuration for the public listener
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address, either `host:port` or `:port`. In ACME mode this is the
    /// public hostname certificates are requested for instead.
    pub address: String,
    /// Serve plaintext HTTP. Takes precedence over every other TLS setting.
    pub tls_disable: bool,
    /// Also bind port 80 and answer every request with a 301 to https
    pub tls_autoredirect: bool,
    /// PEM certificate chain file, must be set together with `tls_key_file`
    pub tls_cert_file: Option<PathBuf>,
    /// PEM private key file, must be set together with `tls_cert_file`
    pub tls_key_file: Option<PathBuf>,
    /// Directory where ACME account and certificate state is cached
    pub tls_acme_cache: PathBuf,
    /// Contact email for the ACME account
    pub tls_acme_email: Option<String>,
    /// Use the ACME staging directory instead of production
    pub tls_acme_staging: bool,
    /// Directory the web assets are served from
    pub static_root: PathBuf,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8000".to_string(),
            tls_disable: false,
            tls_autoredirect: false,
            tls_cert_file: None,
            tls_key_file: None,
            tls_acme_cache: PathBuf::from("/var/lib/vaultgate/certs"),
            tls_acme_email: None,
            tls_acme_staging: false,
            static_root: PathBuf::from("public"),
        }
    }
}

/// Configuration for the secrets backend connection
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    /// Backend base URL, e.g. `https://vault.internal:8200`
    pub address: String,
    /// Skip backend certificate verification. Only for development setups.
    pub tls_skip_verify: bool,
    /// Secret path holding the runtime configuration document
    pub runtime_config: String,
    /// Auth mount path used for role logins
    pub approle_login: String,
    /// Role id presented on role logins
    pub approle_id: String,
    /// Role secret id. When set, the service logs in with it at startup
    /// instead of redeeming a wrapped token.
    pub approle_secret: Option<String>,
    /// Per-request timeout, humantime format (e.g. `15s`)
    pub request_timeout: String,
    /// Interval between runtime configuration refreshes (e.g. `5m`)
    pub runtime_refresh: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            tls_skip_verify: false,
            runtime_config: "secret/vaultgate".to_string(),
            approle_login: "auth/approle/login".to_string(),
            approle_id: "vaultgate".to_string(),
            approle_secret: None,
            request_timeout: "15s".to_string(),
            runtime_refresh: "5m".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Configuration for `--dev` runs: plaintext listener on localhost, backend
    /// pointed at the ephemeral in-process instance.
    pub fn dev(backend_address: &str, runtime_path: &str) -> Self {
        Self {
            listener: ListenerConfig {
                tls_disable: true,
                ..ListenerConfig::default()
            },
            vault: VaultConfig {
                address: backend_address.to_string(),
                runtime_config: runtime_path.to_string(),
                ..VaultConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use config::{Config, File, FileFormat};

    use super::*;

    #[test]
    fn test_default_config_is_localhost_with_tls_expected() {
        let config = ServiceConfig::default();
        assert_eq!(config.listener.address, "127.0.0.1:8000");
        assert!(!config.listener.tls_disable);
        assert!(config.listener.tls_cert_file.is_none());
        assert_eq!(config.vault.address, "http://127.0.0.1:8200");
        assert_eq!(config.vault.runtime_config, "secret/vaultgate");
    }

    #[test]
    fn test_dev_config_points_at_ephemeral_backend() {
        let config = ServiceConfig::dev("http://127.0.0.1:39471", "secret/vaultgate");
        assert!(config.listener.tls_disable);
        assert_eq!(config.vault.address, "http://127.0.0.1:39471");
        assert!(config.vault.approle_secret.is_none());
    }

    #[test]
    fn test_partial_toml_deserializes_with_defaults() {
        let config: ServiceConfig = Config::builder()
            .add_source(File::from_str(
                r#"
[listener]
address = ":8080"
tls_disable = true

[vault]
address = "https://vault.internal:8200"
"#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.listener.address, ":8080");
        assert!(config.listener.tls_disable);
        assert_eq!(config.listener.static_root, PathBuf::from("public"));
        assert_eq!(config.vault.request_timeout, "15s");
        assert_eq!(config.vault.approle_id, "vaultgate");
    }
}
