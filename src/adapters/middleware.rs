//! The security envelope wrapped around every route, static assets included.
//!
//! Four stages, outermost first: access logging, panic recovery, CSRF
//! enforcement, hardened response headers. The envelope is attached once,
//! before any listener binds, so no request is ever served outside it.
//! Stages stay stateless except for the shared CSRF verifier.
use std::{any::Any, future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{ConnectInfo, MatchedPath, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use uuid::Uuid;

use crate::{
    core::csrf::{CSRF_COOKIE, CSRF_HEADER, CsrfProtect, cookie_value},
    metrics::{RequestTimer, increment_request_total},
};

/// Content-Security-Policy for the web UI. GitHub hosts are allowed because
/// the frontend loads button widgets and release metadata from there.
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'self' blob: 'unsafe-inline' buttons.github.io api.github.com";

/// Log every request with a generated id, and feed the request metrics.
///
/// Metrics are labelled with the matched route pattern (`/api/mounts/{mount}`
/// rather than the concrete URI) to keep label cardinality bounded; anything
/// the static fallback answers is labelled `static`.
pub async fn access_log_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "static".to_string());
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    let _timer = RequestTimer::new(&route, method.as_str());
    let mut response = next.run(req).await;
    let status = response.status();
    increment_request_total(&route, method.as_str(), status.as_u16());

    tracing::info!(
        method = %method,
        uri = %uri,
        status = status.as_u16(),
        client = %client,
        request_id = %request_id,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", header_value);
    }

    response
}

/// Add browser hardening headers. Only attached when the listener policy
/// terminates TLS; a plaintext deployment would be lying with them.
pub async fn hardened_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "X-XSS-Protection",
        HeaderValue::from_static("1; mode=block"),
    );

    response
}

/// Enforce the double-submit CSRF check on state-changing methods.
///
/// Read-only methods pass untouched. Everything else must carry the token
/// cookie and the matching `X-CSRF-Token` header or is answered 403 before
/// any handler runs.
pub async fn csrf_enforcement(req: Request, next: Next, csrf: Arc<CsrfProtect>) -> Response {
    let safe = matches!(
        req.method().as_str(),
        "GET" | "HEAD" | "OPTIONS" | "TRACE"
    );
    if safe {
        return next.run(req).await;
    }

    let presented_ok = {
        let headers = req.headers();
        let cookie = cookie_value(headers, CSRF_COOKIE);
        let header = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
        match (cookie, header) {
            (Some(cookie), Some(header)) => csrf.verify_pair(cookie, header),
            _ => false,
        }
    };

    if presented_ok {
        next.run(req).await
    } else {
        tracing::warn!(
            method = %req.method(),
            path = %req.uri().path(),
            "rejecting request with missing or invalid CSRF token"
        );
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "errors": ["invalid or missing CSRF token"] })),
        )
            .into_response()
    }
}

/// Create a cloneable closure wrapping [`csrf_enforcement`].
pub fn create_csrf_middleware(
    csrf: Arc<CsrfProtect>,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| {
        let csrf = csrf.clone();
        Box::pin(async move { csrf_enforcement(req, next, csrf).await })
    }
}

/// Turn a handler panic into a JSON 500 instead of a dropped connection.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "errors": ["internal server error"] })),
    )
        .into_response()
}

/// Wrap a router in the full envelope.
///
/// Layers run outermost-last, so they are attached in reverse of the wire
/// order: headers (when hardened), CSRF, panic recovery, access log.
pub fn apply_security_envelope(
    router: Router,
    csrf: Arc<CsrfProtect>,
    hardened: bool,
) -> Router {
    let mut router = router;
    if hardened {
        router = router.layer(middleware::from_fn(hardened_headers_middleware));
    }
    router
        .layer(middleware::from_fn(create_csrf_middleware(csrf)))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(access_log_middleware))
}
