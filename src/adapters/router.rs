//! Mounts the declarative route table onto an axum `Router` and wraps it in
//! the security envelope. Nothing else in the crate registers paths.
use axum::{
    Router,
    routing::{MethodFilter, MethodRouter, on},
};
use eyre::{Result, WrapErr, eyre};
use tower_http::services::ServeDir;

use crate::{
    adapters::{handlers, middleware::apply_security_envelope},
    core::routes::{Capability, ROUTES, RouteEntry, verify_unique},
};

pub use crate::adapters::handlers::ApiContext;

fn handler_for(entry: &RouteEntry, filter: MethodFilter) -> MethodRouter<ApiContext> {
    match entry.capability {
        Capability::Health => on(filter, handlers::health),
        Capability::FetchCsrf => on(filter, handlers::fetch_csrf),
        Capability::Login => on(filter, handlers::login),
        Capability::RenewSelf => on(filter, handlers::renew_self),
        Capability::ListUsers => on(filter, handlers::list_users),
        Capability::TokenCount => on(filter, handlers::token_count),
        Capability::CurrentRole => on(filter, handlers::current_role),
        Capability::ListRoles => on(filter, handlers::list_roles),
        Capability::RevokeUser => on(filter, handlers::revoke_user),
        Capability::CreateUser => on(filter, handlers::create_user),
        Capability::ReadPolicy => on(filter, handlers::read_policy),
        Capability::DeletePolicy => on(filter, handlers::delete_policy),
        Capability::ListPolicyRequests => on(filter, handlers::list_policy_requests),
        Capability::AddPolicyRequest => on(filter, handlers::add_policy_request),
        Capability::UpdatePolicyRequest => on(filter, handlers::update_policy_request),
        Capability::DeletePolicyRequest => on(filter, handlers::delete_policy_request),
        Capability::TransitInfo => on(filter, handlers::transit_info),
        Capability::TransitEncrypt => on(filter, handlers::transit_encrypt),
        Capability::TransitDecrypt => on(filter, handlers::transit_decrypt),
        Capability::ListMounts => on(filter, handlers::list_mounts),
        Capability::ReadMount => on(filter, handlers::read_mount),
        Capability::TuneMount => on(filter, handlers::tune_mount),
        Capability::ReadSecrets => on(filter, handlers::read_secrets),
        Capability::WriteSecrets => on(filter, handlers::write_secrets),
        Capability::DeleteSecrets => on(filter, handlers::delete_secrets),
        Capability::Bulletins => on(filter, handlers::bulletins),
        Capability::Wrap => on(filter, handlers::wrap),
        Capability::Unwrap => on(filter, handlers::unwrap),
    }
}

/// Build the complete application router.
///
/// Verifies the route table's non-collision contract first so a bad table is
/// a clean bootstrap error rather than a mount-time panic. Paths sharing a
/// route with different methods are merged into one `MethodRouter`. All
/// non-API paths fall back to the static asset bundle under `static_root`.
pub fn build_app(
    ctx: ApiContext,
    static_root: impl AsRef<std::path::Path>,
    hardened: bool,
) -> Result<Router> {
    verify_unique(ROUTES).wrap_err("route table check failed")?;

    let mut paths: Vec<(&'static str, MethodRouter<ApiContext>)> = Vec::new();
    for entry in ROUTES {
        let filter = MethodFilter::try_from(entry.method.clone())
            .map_err(|e| eyre!("route {} {}: {e}", entry.method, entry.path))?;
        let handler = handler_for(entry, filter);
        match paths.iter_mut().find(|(path, _)| *path == entry.path) {
            Some((_, existing)) => {
                *existing = std::mem::take(existing).merge(handler);
            }
            None => paths.push((entry.path, handler)),
        }
    }

    let mut api = Router::new();
    for (path, methods) in paths {
        api = api.route(path, methods);
    }

    let csrf = ctx.csrf.clone();
    let router = api
        .fallback_service(ServeDir::new(static_root))
        .with_state(ctx);

    Ok(apply_security_envelope(router, csrf, hardened))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt; // for oneshot

    use super::*;
    use crate::{
        core::{
            csrf::{CSRF_COOKIE, CSRF_HEADER, CsrfProtect},
            runtime::RuntimeHandle,
            session::Session,
        },
        ports::{AuthGrant, BackendClient, BackendResult, RelayResponse},
    };

    struct StubBackend;

    #[async_trait]
    impl BackendClient for StubBackend {
        async fn health(&self) -> BackendResult<Value> {
            Ok(json!({ "sealed": false }))
        }

        async fn unwrap_token(&self, _wrapping_token: &str) -> BackendResult<AuthGrant> {
            unimplemented!()
        }

        async fn approle_login(
            &self,
            _login_path: &str,
            _role_id: &str,
            _secret_id: &str,
        ) -> BackendResult<AuthGrant> {
            unimplemented!()
        }

        async fn renew_self(&self, _token: &str) -> BackendResult<AuthGrant> {
            unimplemented!()
        }

        async fn read_secret(&self, _token: &str, _path: &str) -> BackendResult<Value> {
            Ok(json!({
                "default_secret_path": "secret/",
                "transit_backend": "transit",
                "server_transit_key": "vaultgate-server",
                "user_transit_key": "vaultgate-user",
                "bulletin_path": "secret/bulletins/"
            }))
        }

        async fn relay(
            &self,
            _token: Option<&str>,
            _method: Method,
            _path: &str,
            _body: Option<Value>,
        ) -> BackendResult<RelayResponse> {
            Ok(RelayResponse {
                status: 200,
                body: json!({ "ok": true }),
            })
        }
    }

    async fn test_context() -> ApiContext {
        let backend = Arc::new(StubBackend);
        let session = Arc::new(Session::from_grant(AuthGrant {
            client_token: "s.service".to_string(),
            lease_duration_secs: 3600,
            renewable: true,
        }));
        let runtime = Arc::new(
            RuntimeHandle::load_initial(backend.as_ref(), &session, "secret/vaultgate")
                .await
                .unwrap(),
        );
        ApiContext {
            backend,
            session,
            runtime,
            csrf: Arc::new(CsrfProtect::new()),
            secure_cookies: false,
        }
    }

    #[tokio::test]
    async fn test_api_route_dispatches_to_handler() {
        let ctx = test_context().await;
        let app = build_app(ctx, "nonexistent-assets", false).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["sealed"], json!(false));
    }

    #[tokio::test]
    async fn test_unknown_path_falls_back_to_static_404() {
        let ctx = test_context().await;
        let app = build_app(ctx, "nonexistent-assets", false).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/no/such/page")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_fallback_serves_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>vaultgate</h1>").unwrap();

        let ctx = test_context().await;
        let app = build_app(ctx, dir.path().to_str().unwrap(), false).unwrap();

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("vaultgate"));
    }

    #[tokio::test]
    async fn test_mutations_are_csrf_gated() {
        let ctx = test_context().await;
        let csrf = ctx.csrf.clone();
        let app = build_app(ctx, "nonexistent-assets", false).unwrap();

        // Without a token pair the envelope rejects the request.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/login")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"type":"ldap","id":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // With one, the request reaches the handler (which rejects the
        // unsupported login type itself).
        let token = csrf.issue();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/login")
                    .header("Content-Type", "application/json")
                    .header("Cookie", format!("{CSRF_COOKIE}={token}"))
                    .header(CSRF_HEADER, &token)
                    .body(Body::from(r#"{"type":"ldap","id":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_method_is_not_allowed() {
        let ctx = test_context().await;
        let csrf = ctx.csrf.clone();
        let app = build_app(ctx, "nonexistent-assets", false).unwrap();

        let token = csrf.issue();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/health")
                    .header("Cookie", format!("{CSRF_COOKIE}={token}"))
                    .header(CSRF_HEADER, &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_shared_path_multiple_methods() {
        let ctx = test_context().await;
        let csrf = ctx.csrf.clone();
        let app = build_app(ctx, "nonexistent-assets", false).unwrap();

        // GET and DELETE on /api/secrets land on different handlers.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/secrets")
                    .header("X-Vault-Token", "s.caller")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let token = csrf.issue();
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/secrets?path=secret/apps/db")
                    .header("X-Vault-Token", "s.caller")
                    .header("Cookie", format!("{CSRF_COOKIE}={token}"))
                    .header(CSRF_HEADER, &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
