use std::collections::HashSet;

use http::Method;

/// Everything the API surface can do, one variant per backend capability.
///
/// [`ROUTES`] maps HTTP entry points onto these; the handler layer turns each
/// capability into one backend call. Several paths may share a capability
/// (the CSRF fetch is reachable from three places) but never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Health,
    FetchCsrf,
    Login,
    RenewSelf,
    ListUsers,
    TokenCount,
    CurrentRole,
    ListRoles,
    RevokeUser,
    CreateUser,
    ReadPolicy,
    DeletePolicy,
    ListPolicyRequests,
    AddPolicyRequest,
    UpdatePolicyRequest,
    DeletePolicyRequest,
    TransitInfo,
    TransitEncrypt,
    TransitDecrypt,
    ListMounts,
    ReadMount,
    TuneMount,
    ReadSecrets,
    WriteSecrets,
    DeleteSecrets,
    Bulletins,
    Wrap,
    Unwrap,
}

impl Capability {
    /// Stable name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Health => "health",
            Capability::FetchCsrf => "fetch_csrf",
            Capability::Login => "login",
            Capability::RenewSelf => "renew_self",
            Capability::ListUsers => "list_users",
            Capability::TokenCount => "token_count",
            Capability::CurrentRole => "current_role",
            Capability::ListRoles => "list_roles",
            Capability::RevokeUser => "revoke_user",
            Capability::CreateUser => "create_user",
            Capability::ReadPolicy => "read_policy",
            Capability::DeletePolicy => "delete_policy",
            Capability::ListPolicyRequests => "list_policy_requests",
            Capability::AddPolicyRequest => "add_policy_request",
            Capability::UpdatePolicyRequest => "update_policy_request",
            Capability::DeletePolicyRequest => "delete_policy_request",
            Capability::TransitInfo => "transit_info",
            Capability::TransitEncrypt => "transit_encrypt",
            Capability::TransitDecrypt => "transit_decrypt",
            Capability::ListMounts => "list_mounts",
            Capability::ReadMount => "read_mount",
            Capability::TuneMount => "tune_mount",
            Capability::ReadSecrets => "read_secrets",
            Capability::WriteSecrets => "write_secrets",
            Capability::DeleteSecrets => "delete_secrets",
            Capability::Bulletins => "bulletins",
            Capability::Wrap => "wrap",
            Capability::Unwrap => "unwrap",
        }
    }

    /// Whether the caller must present their own backend token.
    ///
    /// Health, CSRF issuance and the login itself are reachable without one;
    /// everything else acts on the caller's behalf.
    pub fn requires_caller_token(&self) -> bool {
        !matches!(
            self,
            Capability::Health | Capability::FetchCsrf | Capability::Login
        )
    }
}

/// One row of the API surface.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub method: Method,
    pub path: &'static str,
    pub capability: Capability,
}

macro_rules! route {
    ($method:ident, $path:literal, $capability:ident) => {
        RouteEntry {
            method: Method::$method,
            path: $path,
            capability: Capability::$capability,
        }
    };
}

/// The full API surface, declared in one place.
///
/// Mounted verbatim by the router; nothing else registers paths. Paths use
/// axum's `{param}` capture syntax.
pub const ROUTES: &[RouteEntry] = &[
    route!(GET, "/api/health", Health),
    route!(GET, "/api/login/csrf", FetchCsrf),
    route!(POST, "/api/login", Login),
    route!(POST, "/api/login/renew-self", RenewSelf),
    route!(GET, "/api/users", ListUsers),
    route!(GET, "/api/users/csrf", FetchCsrf),
    route!(GET, "/api/tokencount", TokenCount),
    route!(GET, "/api/users/role", CurrentRole),
    route!(GET, "/api/users/listroles", ListRoles),
    route!(POST, "/api/users/revoke", RevokeUser),
    route!(POST, "/api/users/create", CreateUser),
    route!(GET, "/api/policy", ReadPolicy),
    route!(DELETE, "/api/policy", DeletePolicy),
    route!(GET, "/api/policy/request", ListPolicyRequests),
    route!(POST, "/api/policy/request", AddPolicyRequest),
    route!(POST, "/api/policy/request/update", UpdatePolicyRequest),
    route!(DELETE, "/api/policy/request/{id}", DeletePolicyRequest),
    route!(GET, "/api/transit", TransitInfo),
    route!(POST, "/api/transit/encrypt", TransitEncrypt),
    route!(POST, "/api/transit/decrypt", TransitDecrypt),
    route!(GET, "/api/mounts", ListMounts),
    route!(GET, "/api/mounts/{mount}", ReadMount),
    route!(POST, "/api/mounts/{mount}", TuneMount),
    route!(GET, "/api/secrets", ReadSecrets),
    route!(POST, "/api/secrets", WriteSecrets),
    route!(DELETE, "/api/secrets", DeleteSecrets),
    route!(GET, "/api/bulletins", Bulletins),
    route!(GET, "/api/wrapping", FetchCsrf),
    route!(POST, "/api/wrapping/wrap", Wrap),
    route!(POST, "/api/wrapping/unwrap", Unwrap),
];

/// Two entries claimed the same method and path.
#[derive(Debug, thiserror::Error)]
#[error("duplicate route registration: {method} {path}")]
pub struct RouteCollision {
    pub method: Method,
    pub path: &'static str,
}

/// Check the non-collision contract: no two entries share (method, path).
///
/// Runs before mounting so a bad table is a clean bootstrap error instead of
/// a router panic.
pub fn verify_unique(routes: &[RouteEntry]) -> Result<(), RouteCollision> {
    let mut seen = HashSet::new();
    for entry in routes {
        if !seen.insert((entry.method.clone(), entry.path)) {
            return Err(RouteCollision {
                method: entry.method.clone(),
                path: entry.path,
            });
        }
    }
    Ok(())
}
