pub mod backend;

pub use backend::{
    AuthGrant, BackendClient, BackendError, BackendResult, RelayResponse, VAULT_TOKEN_HEADER,
};
