//! Vaultgate - secure bootstrap and listener orchestration for a
//! secrets-management web front end.
//!
//! Vaultgate sits between browsers and a secrets backend. It authenticates
//! itself to the backend before binding any listener, fetches its runtime
//! settings from a secret, and then serves a thin JSON API plus the static
//! frontend bundle behind a fixed security envelope (access logging, panic
//! recovery, CSRF enforcement, hardened headers). This library exposes the
//! building blocks; the binary crate wires them together.
//!
//! # Features
//! - Bootstrap ordering that never serves a route before the backend
//!   authentication and runtime settings are in place
//! - Credential exchange via single-use wrapped tokens or approle login,
//!   with automatic lease renewal
//! - Listener policies: plaintext, operator-supplied certificates (with or
//!   without a port-80 redirect), or ACME-managed certificates
//! - Periodically refreshed runtime settings behind lock-free snapshots
//! - A declarative route table with a checked non-collision contract
//! - An ephemeral in-process dev backend for `--dev` runs
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping policy decisions inside `core`. End users should prefer the
//! re-exports documented below instead of reaching into internal modules
//! directly.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error
//! type. A custom error context is always attached using `WrapErr` for
//! debuggability.
// Re-export public modules with explicit visibility controls
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{ApiContext, DevBackend, VaultHttpClient, build_app, run_listeners},
    core::{
        Credential, CsrfProtect, ListenerPolicy, RuntimeHandle, Session, select_policy,
        session::spawn_renewal,
    },
    ports::BackendClient,
    utils::ShutdownCoordinator,
};
