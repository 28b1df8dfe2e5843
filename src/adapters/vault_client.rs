use std::{cmp, time::Duration};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use http::Method;
use serde_json::{Value, json};
use url::Url;

use crate::{
    config::models::VaultConfig,
    metrics::{BackendOpTimer, increment_backend_request_total},
    ports::backend::{
        AuthGrant, BackendClient, BackendError, BackendResult, RelayResponse, VAULT_TOKEN_HEADER,
    },
};

/// Never wait longer than this for the TCP connect alone.
const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(10);

/// `BackendClient` implementation over the backend's HTTP API.
///
/// Holds one pooled reqwest client with the configured per-request timeout.
/// The session token is never part of this struct; callers pass whichever
/// token each operation acts with.
pub struct VaultHttpClient {
    http: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl VaultHttpClient {
    pub fn new(config: &VaultConfig) -> Result<Self> {
        let timeout = humantime::parse_duration(&config.request_timeout)
            .wrap_err("Invalid vault.request_timeout")?;

        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(cmp::min(timeout, CONNECT_TIMEOUT_CAP));
        if config.tls_skip_verify {
            tracing::warn!("backend certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().wrap_err("Failed to build backend HTTP client")?;

        let mut base = Url::parse(&config.address)
            .wrap_err_with(|| format!("Invalid vault.address '{}'", config.address))?;
        // A trailing slash makes Url::join append instead of replace.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            http,
            base,
            timeout,
        })
    }

    fn api_url(&self, path: &str) -> BackendResult<Url> {
        let relative = format!("v1/{}", path.trim_start_matches('/'));
        self.base
            .join(&relative)
            .map_err(|e| BackendError::InvalidRequest(format!("bad API path '{path}': {e}")))
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.timeout.as_secs_f64().ceil() as u64)
        } else {
            BackendError::Unreachable(e.to_string())
        }
    }

    /// Make one backend call and decode the JSON body, whatever the status.
    async fn call(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&Value>,
    ) -> BackendResult<(u16, Value)> {
        let url = self.api_url(path)?;
        let _timer = BackendOpTimer::new(operation);

        let mut request = self.http.request(method, url);
        if let Some(token) = token {
            request = request.header(VAULT_TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                increment_backend_request_total(operation, "transport_error");
                return Err(self.transport_error(e));
            }
        };

        let status = response.status().as_u16();
        increment_backend_request_total(operation, &status.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|e| {
                BackendError::MalformedResponse(format!("backend sent a non-JSON body: {e}"))
            })?
        };

        Ok((status, body))
    }
}

/// Join the `errors` array the backend puts in failure bodies.
fn api_messages(body: &Value) -> String {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown backend error".to_string())
}

/// Decode a login-style response into a grant.
///
/// 400 and 403 mean the backend looked at the credential and said no, which
/// is a different failure from the backend being broken.
fn parse_auth(status: u16, body: Value) -> BackendResult<AuthGrant> {
    if !(200..300).contains(&status) {
        let message = api_messages(&body);
        return Err(match status {
            400 | 403 => BackendError::CredentialRejected(message),
            _ => BackendError::Api { status, message },
        });
    }

    let auth = body
        .get("auth")
        .filter(|a| !a.is_null())
        .ok_or_else(|| BackendError::MalformedResponse("response carries no auth block".into()))?;
    let client_token = auth
        .get("client_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            BackendError::MalformedResponse("auth block carries no client_token".into())
        })?
        .to_string();

    Ok(AuthGrant {
        client_token,
        lease_duration_secs: auth.get("lease_duration").and_then(Value::as_u64).unwrap_or(0),
        renewable: auth.get("renewable").and_then(Value::as_bool).unwrap_or(false),
    })
}

#[async_trait]
impl BackendClient for VaultHttpClient {
    async fn health(&self) -> BackendResult<Value> {
        // The health endpoint encodes state (standby, sealed, ...) in
        // non-2xx statuses with a JSON body either way, so any decoded
        // body is a successful health read.
        let (_, body) = self
            .call("health", Method::GET, "sys/health", None, None)
            .await?;
        if body.is_null() {
            return Err(BackendError::MalformedResponse(
                "health endpoint sent an empty body".into(),
            ));
        }
        Ok(body)
    }

    async fn unwrap_token(&self, wrapping_token: &str) -> BackendResult<AuthGrant> {
        let (status, body) = self
            .call(
                "unwrap",
                Method::POST,
                "sys/wrapping/unwrap",
                Some(wrapping_token),
                None,
            )
            .await?;
        parse_auth(status, body)
    }

    async fn approle_login(
        &self,
        login_path: &str,
        role_id: &str,
        secret_id: &str,
    ) -> BackendResult<AuthGrant> {
        let payload = json!({ "role_id": role_id, "secret_id": secret_id });
        let (status, body) = self
            .call("approle_login", Method::POST, login_path, None, Some(&payload))
            .await?;
        parse_auth(status, body)
    }

    async fn renew_self(&self, token: &str) -> BackendResult<AuthGrant> {
        let (status, body) = self
            .call(
                "renew_self",
                Method::POST,
                "auth/token/renew-self",
                Some(token),
                None,
            )
            .await?;
        parse_auth(status, body)
    }

    async fn read_secret(&self, token: &str, path: &str) -> BackendResult<Value> {
        let (status, body) = self
            .call("read_secret", Method::GET, path, Some(token), None)
            .await?;
        if !(200..300).contains(&status) {
            return Err(BackendError::Api {
                status,
                message: api_messages(&body),
            });
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| BackendError::MalformedResponse("secret carries no data block".into()))
    }

    async fn relay(
        &self,
        token: Option<&str>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> BackendResult<RelayResponse> {
        let (status, body) = self
            .call("relay", method, path, token, body.as_ref())
            .await?;
        Ok(RelayResponse { status, body })
    }
}
