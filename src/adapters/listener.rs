//! Listener orchestration: turns a [`ListenerPolicy`] into bound sockets.
//!
//! Binding happens only after authentication and runtime settings are in
//! place, so no route is ever reachable on a half-initialized service. The
//! redirecting policies additionally run a plaintext listener on port 80
//! whose only job is to send browsers to the HTTPS address.
use std::{fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc};

use axum::{
    Router,
    extract::Request,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    serve::{Listener, ListenerExt},
};
use eyre::{Result, WrapErr, eyre};
use futures_util::StreamExt;
use rustls_acme::{AcmeConfig, caches::DirCache};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::broadcast,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};

use crate::{core::policy::ListenerPolicy, utils::ShutdownCoordinator};

/// Where the HTTP-to-HTTPS redirect listens.
const REDIRECT_ADDRESS: &str = "0.0.0.0:80";

/// Where the ACME policy terminates TLS. The configured address names the
/// certificate host in that mode, not a socket.
const ACME_ADDRESS: &str = "0.0.0.0:443";

/// Bridges a TLS accept stream into axum's `Listener` trait.
struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// A bare `:port` binds every interface.
fn normalize_bind_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

async fn bind(address: &str) -> Result<TcpListener> {
    let target = normalize_bind_address(address);
    TcpListener::bind(&target)
        .await
        .wrap_err_with(|| format!("failed to bind {target}"))
}

/// Run the listeners the policy calls for, until shutdown.
pub async fn run_listeners(
    policy: ListenerPolicy,
    address: &str,
    app: Router,
    shutdown: &ShutdownCoordinator,
) -> Result<()> {
    match policy {
        ListenerPolicy::Disabled => {
            let listener = bind(address).await?;
            tracing::info!(
                addr = %listener.local_addr().wrap_err("failed to get local addr")?,
                "serving plaintext HTTP (tls_disable set)"
            );
            serve_plain(listener, app, shutdown.subscribe()).await
        }
        ListenerPolicy::ExplicitCert { cert, key } => {
            let listener = bind(address).await?;
            tracing::info!(
                addr = %listener.local_addr().wrap_err("failed to get local addr")?,
                "serving HTTPS with configured certificate"
            );
            serve_explicit_cert(listener, &cert, &key, app, shutdown.subscribe()).await
        }
        ListenerPolicy::AutoRedirect { cert, key } => {
            let redirect_listener = bind(REDIRECT_ADDRESS).await?;
            let redirect_task =
                tokio::spawn(serve_redirect(redirect_listener, shutdown.subscribe()));

            let listener = bind(address).await?;
            tracing::info!(
                addr = %listener.local_addr().wrap_err("failed to get local addr")?,
                "serving HTTPS with configured certificate, redirecting port 80"
            );
            let result =
                serve_explicit_cert(listener, &cert, &key, app, shutdown.subscribe()).await;
            redirect_task.abort();
            result
        }
        ListenerPolicy::AutocertAcme {
            host,
            cache_dir,
            contact_email,
            staging,
        } => {
            let redirect_listener = bind(REDIRECT_ADDRESS).await?;
            let redirect_task =
                tokio::spawn(serve_redirect(redirect_listener, shutdown.subscribe()));

            let listener = bind(ACME_ADDRESS).await?;
            tracing::info!(host, staging, "serving HTTPS with ACME-managed certificate");
            let result = serve_acme(
                listener,
                &host,
                &cache_dir,
                contact_email.as_deref(),
                staging,
                app,
                shutdown.subscribe(),
            )
            .await;
            redirect_task.abort();
            result
        }
    }
}

async fn serve_plain(
    listener: TcpListener,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.wrap_err("listener failed")
        }
        _ = shutdown.recv() => Ok(()),
    }
}

async fn serve_explicit_cert(
    listener: TcpListener,
    cert_path: &Path,
    key_path: &Path,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let config = load_tls_config(cert_path, key_path)?;
    let local_addr = listener.local_addr().wrap_err("failed to get local addr")?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
    let stream = TlsListener::new(acceptor, listener);

    let tls_listener = AxumListener { stream, local_addr }.tap_io(|_| {});
    tokio::select! {
        result = axum::serve(
            tls_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.wrap_err("TLS listener failed")
        }
        _ = shutdown.recv() => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_acme(
    listener: TcpListener,
    host: &str,
    cache_dir: &Path,
    contact_email: Option<&str>,
    staging: bool,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut acme = AcmeConfig::new([host.to_string()]);
    if let Some(email) = contact_email {
        acme = acme.contact([format!("mailto:{email}")]);
    }
    let state = acme
        .cache_option(Some(DirCache::new(cache_dir.to_path_buf())))
        .directory_lets_encrypt(!staging)
        .state();

    let local_addr = listener.local_addr().wrap_err("failed to get local addr")?;
    let incoming = state.incoming(
        TcpListenerStream::new(listener).map(|res| res.map(|s| s.compat())),
        vec![],
    );
    let stream = incoming
        .filter_map(|res| async {
            match res {
                Ok(stream) => {
                    let stream = stream.compat();
                    let addr = stream
                        .get_ref()
                        .get_ref()
                        .0
                        .get_ref()
                        .peer_addr()
                        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
                    Some(Ok::<_, std::io::Error>((stream, addr)))
                }
                Err(e) => {
                    tracing::debug!("TLS accept error: {}", e);
                    None
                }
            }
        })
        .boxed();

    let tls_listener = AxumListener { stream, local_addr }.tap_io(|_| {});
    tokio::select! {
        result = axum::serve(
            tls_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result.wrap_err("ACME listener failed")
        }
        _ = shutdown.recv() => Ok(()),
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let cert_file =
        &mut BufReader::new(File::open(cert_path).wrap_err("failed to open certificate file")?);
    let key_file = &mut BufReader::new(File::open(key_path).wrap_err("failed to open key file")?);

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("no PKCS#8 private key found in {}", key_path.display()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .wrap_err("invalid certificate/key pair")
}

/// Answer every request with a 301 to the HTTPS origin.
///
/// The target host comes from the request's own Host header (an explicit
/// `:80` is dropped); the path and query are carried over untouched.
async fn redirect_to_https(req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.strip_suffix(":80").unwrap_or(h))
        .unwrap_or("");
    if host.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let path_and_query = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    let target = format!("https://{host}{path_and_query}");
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, target)]).into_response()
}

fn redirect_router() -> Router {
    Router::new().fallback(redirect_to_https)
}

async fn serve_redirect(
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    tokio::select! {
        result = axum::serve(listener, redirect_router().into_make_service()) => {
            result.wrap_err("redirect listener failed")
        }
        _ = shutdown.recv() => Ok(()),
    }
}
