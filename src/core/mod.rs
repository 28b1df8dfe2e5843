pub mod csrf;
pub mod policy;
pub mod routes;
pub mod runtime;
pub mod session;

pub use csrf::CsrfProtect;
pub use policy::{ListenerPolicy, select_policy};
pub use routes::{Capability, ROUTES, RouteEntry};
pub use runtime::{RuntimeConfig, RuntimeHandle};
pub use session::{Credential, Session};
