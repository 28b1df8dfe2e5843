use eyre::Result;

use crate::config::models::{ListenerConfig, ServiceConfig, VaultConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listener address '{address}': {reason}")]
    InvalidListenerAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Service configuration validator.
///
/// Collects every problem before reporting so an operator fixes a broken
/// config in one round trip instead of replaying the startup failure.
pub struct ServiceConfigValidator;

impl ServiceConfigValidator {
    /// Validate the entire service configuration
    pub fn validate(config: &ServiceConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(mut listener_errors) = Self::validate_listener(&config.listener) {
            errors.append(&mut listener_errors);
        }

        if let Err(mut vault_errors) = Self::validate_vault(&config.vault) {
            errors.append(&mut vault_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listener(listener: &ListenerConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if listener.address.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "listener.address".to_string(),
            });
        }

        match (&listener.tls_cert_file, &listener.tls_key_file) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    errors.push(ValidationError::InvalidTls {
                        message: format!("Certificate file does not exist: {}", cert.display()),
                    });
                }
                if !key.exists() {
                    errors.push(ValidationError::InvalidTls {
                        message: format!("Private key file does not exist: {}", key.display()),
                    });
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                errors.push(ValidationError::InvalidTls {
                    message: "tls_cert_file and tls_key_file must be set together".to_string(),
                });
            }
            (None, None) => {}
        }

        let acme_mode = !listener.tls_disable
            && listener.tls_cert_file.is_none()
            && listener.tls_key_file.is_none();
        if acme_mode {
            // The address doubles as the certificate hostname here, so it must
            // be a bare DNS name rather than a bind address.
            if let Err(e) = Self::validate_acme_hostname(&listener.address) {
                errors.push(e);
            }
            if listener.tls_acme_cache.as_os_str().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "listener.tls_acme_cache".to_string(),
                });
            }
        } else if !listener.address.trim().is_empty() {
            if let Err(e) = Self::validate_bind_address(&listener.address) {
                errors.push(e);
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_vault(vault: &VaultConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_url(&vault.address, "vault.address") {
            errors.push(e);
        }

        if vault.runtime_config.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "vault.runtime_config".to_string(),
            });
        }

        if vault.approle_login.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "vault.approle_login".to_string(),
            });
        }

        if matches!(&vault.approle_secret, Some(s) if !s.is_empty())
            && vault.approle_id.trim().is_empty()
        {
            errors.push(ValidationError::MissingField {
                field: "vault.approle_id".to_string(),
            });
        }

        for (field, value) in [
            ("vault.request_timeout", &vault.request_timeout),
            ("vault.runtime_refresh", &vault.runtime_refresh),
        ] {
            if let Err(e) = humantime::parse_duration(value) {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Not a valid duration (like '15s' or '5m'): {e}"),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate a bind address, either `host:port` or the shorthand `:port`
    fn validate_bind_address(address: &str) -> ValidationResult<()> {
        let port = match address.rsplit_once(':') {
            Some((_, port)) => port,
            None => {
                return Err(ValidationError::InvalidListenerAddress {
                    address: address.to_string(),
                    reason: "Must be in format 'host:port' or ':port' (e.g., ':8000')".to_string(),
                });
            }
        };

        if port.parse::<u16>().is_err() {
            return Err(ValidationError::InvalidListenerAddress {
                address: address.to_string(),
                reason: format!("'{port}' is not a valid port number"),
            });
        }

        Ok(())
    }

    /// Validate the hostname certificates will be requested for
    fn validate_acme_hostname(address: &str) -> ValidationResult<()> {
        if address.trim().is_empty() {
            return Ok(()); // Already reported as a missing field.
        }

        if address.contains(':') || address.contains('/') {
            return Err(ValidationError::InvalidListenerAddress {
                address: address.to_string(),
                reason: "Certificate mode needs a bare hostname (e.g., 'vault.example.com'); \
                         set tls_cert_file/tls_key_file or tls_disable to use a bind address"
                    .to_string(),
            });
        }

        if !address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            return Err(ValidationError::InvalidListenerAddress {
                address: address.to_string(),
                reason: "Hostname may only contain letters, digits, '-' and '.'".to_string(),
            });
        }

        Ok(())
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
