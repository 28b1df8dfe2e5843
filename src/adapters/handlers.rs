//! Request handlers for the JSON API.
//!
//! Handlers are deliberately thin: extract the caller's backend token where
//! the capability needs one, make the one backend call the capability maps
//! to, and relay the answer. Policy interpretation, caching and any other
//! business logic live in the backend or the frontend, not here.
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::Method;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    core::{
        csrf::{CSRF_HEADER, CsrfProtect, build_cookie},
        runtime::{RuntimeConfig, RuntimeHandle},
        session::Session,
    },
    ports::{BackendClient, BackendError, RelayResponse, VAULT_TOKEN_HEADER},
};

/// Everything a handler needs, cloned per request by axum.
#[derive(Clone)]
pub struct ApiContext {
    /// Client for the secrets backend
    pub backend: Arc<dyn BackendClient>,
    /// The service's own authenticated session
    pub session: Arc<Session>,
    /// Live runtime settings
    pub runtime: Arc<RuntimeHandle>,
    /// CSRF token mint shared with the enforcement middleware
    pub csrf: Arc<CsrfProtect>,
    /// Mark issued cookies `Secure` (set when the listener terminates TLS)
    pub secure_cookies: bool,
}

/// An error a handler answers the client with.
///
/// Serialized as `{"errors": ["..."]}`, the same envelope the backend uses,
/// so the frontend has one error shape to deal with.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing client token")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        let status = match &err {
            BackendError::Unreachable(_) => StatusCode::BAD_GATEWAY,
            BackendError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BackendError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BackendError::CredentialRejected(_) => StatusCode::FORBIDDEN,
            BackendError::Api { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            BackendError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "errors": [self.message] }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Pull the caller's backend token out of the request headers.
fn caller_token(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(VAULT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .ok_or_else(ApiError::unauthorized)
}

/// Hand the backend's answer to the client, status included.
fn relay_response(relayed: RelayResponse) -> Response {
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(relayed.body)).into_response()
}

/// Where request bodies name one user out of several auth mounts.
#[derive(Debug, Deserialize)]
pub struct UserSelector {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attributes: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserTypeQuery {
    #[serde(rename = "type", default = "default_user_kind")]
    pub kind: String,
}

fn default_user_kind() -> String {
    "token".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct PolicyQuery {
    #[serde(default)]
    pub policy: String,
}

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    pub policy: String,
    #[serde(default)]
    pub rules: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SecretPathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct EncryptRequest {
    pub plaintext: String,
}

#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    pub ciphertext: String,
}

#[derive(Debug, Deserialize)]
pub struct UnwrapRequest {
    pub token: String,
}

/// Where policy change requests are stored, relative to the browsing root.
fn policy_request_path(runtime: &RuntimeConfig, id: &str) -> String {
    let base = runtime.default_secret_path.trim_end_matches('/');
    if id.is_empty() {
        format!("{base}/policy-requests")
    } else {
        format!("{base}/policy-requests/{id}")
    }
}

pub async fn health(State(ctx): State<ApiContext>) -> ApiResult<Json<Value>> {
    let report = ctx.backend.health().await?;
    Ok(Json(report))
}

/// Issue a CSRF token: the signed value goes out as an HttpOnly cookie and,
/// for the frontend to echo back, in both the response header and the body.
pub async fn fetch_csrf(State(ctx): State<ApiContext>) -> Response {
    let token = ctx.csrf.issue();
    let cookie = build_cookie(&token, ctx.secure_cookies);

    let mut response = Json(json!({ "csrf": token })).into_response();
    // The token is base64url and the attributes are fixed ASCII, so these
    // only fail if the cookie constant itself is broken.
    if let Ok(value) = HeaderValue::from_str(&token) {
        response.headers_mut().insert(CSRF_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

pub async fn login(
    State(ctx): State<ApiContext>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Response> {
    let relayed = match request.kind.as_str() {
        // A raw token: look it up so the caller learns whether it works and
        // what it can do. The backend never echoes the token back.
        "token" => {
            ctx.backend
                .relay(Some(&request.id), Method::GET, "auth/token/lookup-self", None)
                .await?
        }
        "userpass" => {
            let path = format!("auth/userpass/login/{}", request.id);
            ctx.backend
                .relay(
                    None,
                    Method::POST,
                    &path,
                    Some(json!({ "password": request.password })),
                )
                .await?
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unsupported login type '{other}'"
            )));
        }
    };
    Ok(relay_response(relayed))
}

pub async fn renew_self(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(Some(token), Method::POST, "auth/token/renew-self", None)
        .await?;
    Ok(relay_response(relayed))
}

pub async fn list_users(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(query): Query<UserTypeQuery>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let path = match query.kind.as_str() {
        "token" => "auth/token/accessors?list=true",
        "userpass" => "auth/userpass/users?list=true",
        "approle" => "auth/approle/role?list=true",
        other => {
            return Err(ApiError::bad_request(format!(
                "unsupported user type '{other}'"
            )));
        }
    };
    let relayed = ctx.backend.relay(Some(token), Method::GET, path, None).await?;
    Ok(relay_response(relayed))
}

pub async fn token_count(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(
            Some(token),
            Method::GET,
            "auth/token/accessors?list=true",
            None,
        )
        .await?;
    if relayed.status != 200 {
        return Ok(relay_response(relayed));
    }

    let count = relayed
        .body
        .pointer("/data/keys")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    Ok(Json(json!({ "count": count })).into_response())
}

pub async fn current_role(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(Some(token), Method::GET, "auth/token/lookup-self", None)
        .await?;
    Ok(relay_response(relayed))
}

pub async fn list_roles(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(Some(token), Method::GET, "auth/approle/role?list=true", None)
        .await?;
    Ok(relay_response(relayed))
}

pub async fn revoke_user(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(selector): Json<UserSelector>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    if selector.id.is_empty() {
        return Err(ApiError::bad_request("id must not be empty"));
    }

    let relayed = match selector.kind.as_str() {
        "token" => {
            ctx.backend
                .relay(
                    Some(token),
                    Method::POST,
                    "auth/token/revoke-accessor",
                    Some(json!({ "accessor": selector.id })),
                )
                .await?
        }
        "userpass" => {
            let path = format!("auth/userpass/users/{}", selector.id);
            ctx.backend
                .relay(Some(token), Method::DELETE, &path, None)
                .await?
        }
        "approle" => {
            let path = format!("auth/approle/role/{}", selector.id);
            ctx.backend
                .relay(Some(token), Method::DELETE, &path, None)
                .await?
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unsupported user type '{other}'"
            )));
        }
    };
    Ok(relay_response(relayed))
}

pub async fn create_user(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let attributes = match request.attributes {
        Value::Null => None,
        other => Some(other),
    };

    let relayed = match request.kind.as_str() {
        "token" => {
            ctx.backend
                .relay(Some(token), Method::POST, "auth/token/create", attributes)
                .await?
        }
        "userpass" => {
            if request.name.is_empty() {
                return Err(ApiError::bad_request("name must not be empty"));
            }
            let path = format!("auth/userpass/users/{}", request.name);
            ctx.backend
                .relay(Some(token), Method::POST, &path, attributes)
                .await?
        }
        "approle" => {
            if request.name.is_empty() {
                return Err(ApiError::bad_request("name must not be empty"));
            }
            let path = format!("auth/approle/role/{}", request.name);
            ctx.backend
                .relay(Some(token), Method::POST, &path, attributes)
                .await?
        }
        other => {
            return Err(ApiError::bad_request(format!(
                "unsupported user type '{other}'"
            )));
        }
    };
    Ok(relay_response(relayed))
}

pub async fn read_policy(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(query): Query<PolicyQuery>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let path = if query.policy.is_empty() {
        "sys/policy".to_string()
    } else {
        format!("sys/policy/{}", query.policy)
    };
    let relayed = ctx.backend.relay(Some(token), Method::GET, &path, None).await?;
    Ok(relay_response(relayed))
}

pub async fn delete_policy(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(query): Query<PolicyQuery>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    if query.policy.is_empty() {
        return Err(ApiError::bad_request("policy must not be empty"));
    }
    let path = format!("sys/policy/{}", query.policy);
    let relayed = ctx
        .backend
        .relay(Some(token), Method::DELETE, &path, None)
        .await?;
    Ok(relay_response(relayed))
}

/// Change requests are stored under the service's own token so requesters do
/// not need write access to the storage path themselves.
pub async fn list_policy_requests(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    caller_token(&headers)?;
    let runtime = ctx.runtime.snapshot();
    let path = format!("{}?list=true", policy_request_path(&runtime, ""));
    let relayed = ctx
        .backend
        .relay(Some(ctx.session.token()), Method::GET, &path, None)
        .await?;
    Ok(relay_response(relayed))
}

pub async fn add_policy_request(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(request): Json<PolicyRequest>,
) -> ApiResult<Response> {
    caller_token(&headers)?;
    if request.policy.is_empty() {
        return Err(ApiError::bad_request("policy must not be empty"));
    }
    let runtime = ctx.runtime.snapshot();
    let path = policy_request_path(&runtime, &request.policy);
    let relayed = ctx
        .backend
        .relay(
            Some(ctx.session.token()),
            Method::POST,
            &path,
            Some(json!({ "policy": request.policy, "rules": request.rules })),
        )
        .await?;
    Ok(relay_response(relayed))
}

/// Approving a request writes the policy; the caller needs the backend
/// rights to do that, which is exactly the check we want.
pub async fn update_policy_request(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(request): Json<PolicyRequest>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    if request.policy.is_empty() {
        return Err(ApiError::bad_request("policy must not be empty"));
    }
    let path = format!("sys/policy/{}", request.policy);
    let relayed = ctx
        .backend
        .relay(
            Some(token),
            Method::PUT,
            &path,
            Some(json!({ "rules": request.rules })),
        )
        .await?;
    Ok(relay_response(relayed))
}

pub async fn delete_policy_request(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    caller_token(&headers)?;
    let runtime = ctx.runtime.snapshot();
    let path = policy_request_path(&runtime, &id);
    let relayed = ctx
        .backend
        .relay(Some(ctx.session.token()), Method::DELETE, &path, None)
        .await?;
    Ok(relay_response(relayed))
}

/// Names only; the keys themselves never leave the backend.
pub async fn transit_info(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    caller_token(&headers)?;
    let runtime = ctx.runtime.snapshot();
    Ok(Json(json!({
        "backend": runtime.transit_backend,
        "server_key": runtime.server_transit_key,
        "user_key": runtime.user_transit_key,
    })))
}

pub async fn transit_encrypt(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(request): Json<EncryptRequest>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let runtime = ctx.runtime.snapshot();
    let path = format!(
        "{}/encrypt/{}",
        runtime.transit_backend.trim_end_matches('/'),
        runtime.user_transit_key
    );
    // The transit backend wants base64 input.
    let encoded = STANDARD.encode(request.plaintext.as_bytes());
    let relayed = ctx
        .backend
        .relay(
            Some(token),
            Method::POST,
            &path,
            Some(json!({ "plaintext": encoded })),
        )
        .await?;
    Ok(relay_response(relayed))
}

pub async fn transit_decrypt(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(request): Json<DecryptRequest>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let runtime = ctx.runtime.snapshot();
    let path = format!(
        "{}/decrypt/{}",
        runtime.transit_backend.trim_end_matches('/'),
        runtime.user_transit_key
    );
    let relayed = ctx
        .backend
        .relay(
            Some(token),
            Method::POST,
            &path,
            Some(json!({ "ciphertext": request.ciphertext })),
        )
        .await?;
    Ok(relay_response(relayed))
}

pub async fn list_mounts(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(Some(token), Method::GET, "sys/mounts", None)
        .await?;
    Ok(relay_response(relayed))
}

pub async fn read_mount(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(mount): Path<String>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let path = format!("sys/mounts/{mount}/tune");
    let relayed = ctx.backend.relay(Some(token), Method::GET, &path, None).await?;
    Ok(relay_response(relayed))
}

pub async fn tune_mount(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Path(mount): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let path = format!("sys/mounts/{mount}/tune");
    let body = match body {
        Value::Null => None,
        other => Some(other),
    };
    let relayed = ctx.backend.relay(Some(token), Method::POST, &path, body).await?;
    Ok(relay_response(relayed))
}

/// A trailing slash asks for a listing; anything else reads one secret.
/// Without an explicit path, browsing starts at the configured root.
pub async fn read_secrets(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(query): Query<SecretPathQuery>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let path = if query.path.is_empty() {
        ctx.runtime.snapshot().default_secret_path.clone()
    } else {
        query.path
    };
    let relayed = if path.ends_with('/') {
        let listing = format!("{path}?list=true");
        ctx.backend
            .relay(Some(token), Method::GET, &listing, None)
            .await?
    } else {
        ctx.backend.relay(Some(token), Method::GET, &path, None).await?
    };
    Ok(relay_response(relayed))
}

pub async fn write_secrets(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(query): Query<SecretPathQuery>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    if query.path.is_empty() {
        return Err(ApiError::bad_request("path must not be empty"));
    }
    let relayed = ctx
        .backend
        .relay(Some(token), Method::POST, &query.path, Some(body))
        .await?;
    Ok(relay_response(relayed))
}

pub async fn delete_secrets(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Query(query): Query<SecretPathQuery>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    if query.path.is_empty() {
        return Err(ApiError::bad_request("path must not be empty"));
    }
    let relayed = ctx
        .backend
        .relay(Some(token), Method::DELETE, &query.path, None)
        .await?;
    Ok(relay_response(relayed))
}

/// Bulletins are broadcast content, so they are read under the service's
/// token; the caller only has to be logged in.
pub async fn bulletins(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    caller_token(&headers)?;
    let runtime = ctx.runtime.snapshot();
    let path = format!("{}?list=true", runtime.bulletin_path.trim_end_matches('/'));
    let relayed = ctx
        .backend
        .relay(Some(ctx.session.token()), Method::GET, &path, None)
        .await?;
    Ok(relay_response(relayed))
}

pub async fn wrap(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let token = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(Some(token), Method::POST, "sys/wrapping/wrap", Some(body))
        .await?;
    Ok(relay_response(relayed))
}

pub async fn unwrap(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    Json(request): Json<UnwrapRequest>,
) -> ApiResult<Response> {
    let caller = caller_token(&headers)?;
    let relayed = ctx
        .backend
        .relay(
            Some(caller),
            Method::POST,
            "sys/wrapping/unwrap",
            Some(json!({ "token": request.token })),
        )
        .await?;
    Ok(relay_response(relayed))
}
