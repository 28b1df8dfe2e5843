use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};

use crate::{
    core::session::Session,
    ports::backend::{BackendClient, BackendError},
};

/// Settings that live in the backend rather than the config file, so they can
/// change without a redeploy. Fetched at startup and re-fetched periodically.
///
/// Unknown keys in the stored document are ignored, which lets the document
/// grow before the service does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Secret mount browsing starts from
    pub default_secret_path: String,
    /// Transit mount used for encrypt/decrypt operations
    pub transit_backend: String,
    /// Transit key the service itself encrypts with
    pub server_transit_key: String,
    /// Transit key offered to users for their own data
    pub user_transit_key: String,
    /// Path bulletins are listed from
    pub bulletin_path: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_secret_path: "secret/".to_string(),
            transit_backend: "transit".to_string(),
            server_transit_key: String::new(),
            user_transit_key: String::new(),
            bulletin_path: "secret/bulletins/".to_string(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<(), RuntimeError> {
        if self.transit_backend.is_empty() {
            return Err(RuntimeError::MissingField("transit_backend"));
        }
        if self.server_transit_key.is_empty() {
            return Err(RuntimeError::MissingField("server_transit_key"));
        }
        if self.user_transit_key.is_empty() {
            return Err(RuntimeError::MissingField("user_transit_key"));
        }
        Ok(())
    }
}

/// Error loading or refreshing the runtime settings document
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime settings document is not valid: {0}")]
    Malformed(String),

    #[error("runtime settings missing required field '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn parse_runtime(data: Value) -> Result<RuntimeConfig, RuntimeError> {
    let config: RuntimeConfig =
        serde_json::from_value(data).map_err(|e| RuntimeError::Malformed(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Shared handle to the current runtime settings.
///
/// The initial load is fail-closed: without a valid document the service
/// refuses to start. Refreshes are fail-open: an error keeps the last good
/// snapshot in place. Handlers read snapshots lock-free mid-request.
#[derive(Debug)]
pub struct RuntimeHandle {
    path: String,
    current: ArcSwap<RuntimeConfig>,
}

impl RuntimeHandle {
    /// Fetch and validate the document once, fail-closed.
    pub async fn load_initial(
        client: &dyn BackendClient,
        session: &Session,
        path: &str,
    ) -> Result<Self, RuntimeError> {
        let data = client.read_secret(session.token(), path).await?;
        let config = parse_runtime(data)?;
        tracing::info!(path, "runtime settings loaded");
        Ok(Self {
            path: path.to_string(),
            current: ArcSwap::from_pointee(config),
        })
    }

    /// The secret path the document is read from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The current snapshot. A request that grabbed an earlier snapshot keeps
    /// seeing it consistently; the swap only affects later reads.
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    /// Re-fetch the document. On success, swap it in and report whether it
    /// differed from the previous snapshot. On any error the caller decides;
    /// the snapshot is left untouched.
    pub async fn refresh(
        &self,
        client: &dyn BackendClient,
        session: &Session,
    ) -> Result<bool, RuntimeError> {
        let data = client.read_secret(session.token(), &self.path).await?;
        let config = parse_runtime(data)?;
        let changed = *self.current.load_full() != config;
        if changed {
            self.current.store(Arc::new(config));
        }
        Ok(changed)
    }
}

/// Refresh the runtime settings on an interval until shutdown.
///
/// Failures only warn; serving continues on the last good snapshot.
pub fn spawn_refresh(
    handle: Arc<RuntimeHandle>,
    client: Arc<dyn BackendClient>,
    session: Arc<Session>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("runtime refresh task stopping");
                    break;
                }
                _ = sleep(interval) => {}
            }

            match handle.refresh(client.as_ref(), &session).await {
                Ok(true) => tracing::info!(path = handle.path(), "runtime settings updated"),
                Ok(false) => tracing::debug!(path = handle.path(), "runtime settings unchanged"),
                Err(e) => tracing::warn!(
                    error = %e,
                    path = handle.path(),
                    "runtime refresh failed, keeping last good settings"
                ),
            }
        }
    })
}
