use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use eyre::{Result, WrapErr};
use http::{HeaderMap, StatusCode};
use serde_json::{Value, json};
use tokio::{sync::oneshot, task::JoinHandle};
use uuid::Uuid;

use crate::{ports::backend::VAULT_TOKEN_HEADER, utils::shutdown::ShutdownCoordinator};

/// Where the dev backend stores its runtime settings document.
pub const DEV_RUNTIME_PATH: &str = "secret/vaultgate";

/// In-memory state of the ephemeral backend: freshly minted tokens and the
/// spent-flag for the single wrapped token it hands out.
struct DevState {
    root_token: String,
    wrapping_token: String,
    approle_secret: String,
    wrap_spent: AtomicBool,
}

/// An ephemeral, in-process secrets backend for `--dev` runs.
///
/// Binds `127.0.0.1:0` and implements just the endpoints bootstrap touches:
/// health, a single-use wrapped-token unwrap, a role login, token renewal and
/// the runtime settings read. Everything lives in memory and disappears with
/// the process. Never reachable from outside the host.
pub struct DevBackend {
    addr: SocketAddr,
    root_token: String,
    wrapping_token: String,
    approle_secret: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DevBackend {
    /// Start the backend and mint its credentials.
    pub async fn spawn() -> Result<Self> {
        let state = Arc::new(DevState {
            root_token: format!("hvs.dev-{}", Uuid::new_v4().simple()),
            wrapping_token: format!("hvs.wrap-{}", Uuid::new_v4().simple()),
            approle_secret: Uuid::new_v4().to_string(),
            wrap_spent: AtomicBool::new(false),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .wrap_err("Failed to bind dev backend listener")?;
        let addr = listener
            .local_addr()
            .wrap_err("Failed to read dev backend address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let router = dev_router(state.clone());
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "dev backend serve loop failed");
            }
        });

        tracing::info!(address = %addr, "embedded dev backend listening");

        Ok(Self {
            addr,
            root_token: state.root_token.clone(),
            wrapping_token: state.wrapping_token.clone(),
            approle_secret: state.approle_secret.clone(),
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Base URL for a backend client.
    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn root_token(&self) -> &str {
        &self.root_token
    }

    /// The one wrapped token this backend will redeem.
    pub fn wrapping_token(&self) -> &str {
        &self.wrapping_token
    }

    pub fn approle_secret(&self) -> &str {
        &self.approle_secret
    }

    /// Stop the listener and wait for it to wind down.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }

    /// Hand the backend to the shutdown broadcast: when it fires, the
    /// listener is torn down with everything else.
    pub fn shutdown_on(self, coordinator: &ShutdownCoordinator) -> JoinHandle<()> {
        let mut rx = coordinator.subscribe();
        tokio::spawn(async move {
            let _ = rx.recv().await;
            tracing::info!("shutting down embedded dev backend");
            self.shutdown().await;
        })
    }
}

fn dev_router(state: Arc<DevState>) -> Router {
    Router::new()
        .route("/v1/sys/health", get(health_handler))
        .route("/v1/sys/wrapping/unwrap", post(unwrap_handler))
        .route("/v1/auth/approle/login", post(approle_handler))
        .route("/v1/auth/token/renew-self", post(renew_handler))
        .route("/v1/secret/vaultgate", get(runtime_secret_handler))
        .fallback(unsupported_handler)
        .with_state(state)
}

fn auth_envelope(token: &str) -> Value {
    json!({
        "auth": {
            "client_token": token,
            "lease_duration": 3600,
            "renewable": true
        }
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "errors": [message] }))).into_response()
}

fn presented_token(headers: &HeaderMap) -> &str {
    headers
        .get(VAULT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "initialized": true,
        "sealed": false,
        "standby": false,
        "version": "dev"
    }))
}

async fn unwrap_handler(State(state): State<Arc<DevState>>, headers: HeaderMap) -> Response {
    // The swap marks the token spent; short-circuiting keeps a wrong token
    // from burning the real one.
    let valid = presented_token(&headers) == state.wrapping_token
        && !state.wrap_spent.swap(true, Ordering::SeqCst);
    if valid {
        Json(auth_envelope(&state.root_token)).into_response()
    } else {
        error_response(
            StatusCode::BAD_REQUEST,
            "wrapping token is not valid or does not exist",
        )
    }
}

async fn approle_handler(
    State(state): State<Arc<DevState>>,
    Json(body): Json<Value>,
) -> Response {
    let role_id = body.get("role_id").and_then(Value::as_str).unwrap_or_default();
    let secret_id = body
        .get("secret_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if role_id == "vaultgate" && secret_id == state.approle_secret {
        Json(auth_envelope(&state.root_token)).into_response()
    } else {
        error_response(StatusCode::BAD_REQUEST, "invalid role or secret ID")
    }
}

async fn renew_handler(State(state): State<Arc<DevState>>, headers: HeaderMap) -> Response {
    if presented_token(&headers) == state.root_token {
        Json(auth_envelope(&state.root_token)).into_response()
    } else {
        error_response(StatusCode::FORBIDDEN, "permission denied")
    }
}

async fn runtime_secret_handler(
    State(state): State<Arc<DevState>>,
    headers: HeaderMap,
) -> Response {
    if presented_token(&headers) != state.root_token {
        return error_response(StatusCode::FORBIDDEN, "permission denied");
    }
    Json(json!({
        "data": {
            "default_secret_path": "secret/",
            "transit_backend": "transit",
            "server_transit_key": "vaultgate-server",
            "user_transit_key": "vaultgate-user",
            "bulletin_path": "secret/bulletins/"
        }
    }))
    .into_response()
}

async fn unsupported_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "unsupported path")
}
