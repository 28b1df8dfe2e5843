pub mod dev_backend;
pub mod handlers;
pub mod listener;
pub mod middleware;
pub mod router;
pub mod vault_client;

/// Re-export commonly used types from adapters
pub use dev_backend::DevBackend;
pub use handlers::{ApiContext, ApiError};
pub use listener::run_listeners;
pub use middleware::apply_security_envelope;
pub use router::build_app;
pub use vault_client::VaultHttpClient;
