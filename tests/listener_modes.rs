//! Listener orchestration over real sockets.
//!
//! Exercises the plaintext and explicit-certificate policies end to end,
//! plus the hard-failure paths (occupied port, unreadable certificate).
//! The ACME policy needs a reachable CA and ports 80/443, so it stays out
//! of the suite; its building blocks are covered by unit tests.

use std::{sync::Arc, time::Duration};

use axum::{Router, routing::get};
use eyre::Result;
use tokio::time::timeout;
use vaultgate::{ListenerPolicy, ShutdownCoordinator, run_listeners};

fn install_test_provider() {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    );
}

fn pick_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn ping_router() -> Router {
    Router::new().route("/ping", get(|| async { "pong" }))
}

/// Poll until the listener answers or the retries run out.
async fn get_with_retries(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let mut last_err = None;
    for _ in 0..50 {
        match client.get(url).send().await {
            Ok(response) => return Ok(response),
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    Err(last_err.unwrap().into())
}

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_listener_serves_and_stops_on_shutdown() -> Result<()> {
    let port = pick_free_port();
    let address = format!("127.0.0.1:{port}");

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let server = {
        let shutdown = shutdown.clone();
        let address = address.clone();
        tokio::spawn(async move {
            run_listeners(ListenerPolicy::Disabled, &address, ping_router(), &shutdown).await
        })
    };

    let client = reqwest::Client::new();
    let response = get_with_retries(&client, &format!("http://{address}/ping")).await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "pong");

    // The broadcast stops the serve loop cleanly.
    shutdown.trigger();
    let result = timeout(Duration::from_secs(2), server)
        .await
        .expect("serve loop should stop on shutdown")
        .unwrap();
    assert!(result.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_conflict_is_a_hard_error() -> Result<()> {
    // Hold the port so the orchestrator cannot have it.
    let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = holder.local_addr()?.to_string();

    let shutdown = ShutdownCoordinator::new();
    let result = run_listeners(ListenerPolicy::Disabled, &address, ping_router(), &shutdown).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_cert_policy_serves_tls() -> Result<()> {
    install_test_provider();

    let signed = rcgen::generate_simple_self_signed(["localhost".to_string()])?;
    let dir = tempfile::tempdir()?;
    let cert_path = dir.path().join("tls.crt");
    let key_path = dir.path().join("tls.key");
    std::fs::write(&cert_path, signed.cert.pem())?;
    std::fs::write(&key_path, signed.signing_key.serialize_pem())?;

    let port = pick_free_port();
    let address = format!("127.0.0.1:{port}");
    let policy = ListenerPolicy::ExplicitCert {
        cert: cert_path,
        key: key_path,
    };

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let server = {
        let shutdown = shutdown.clone();
        let address = address.clone();
        tokio::spawn(async move {
            run_listeners(policy, &address, ping_router(), &shutdown).await
        })
    };

    // The certificate is self-signed, so verification is off for the probe.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let response = get_with_retries(&client, &format!("https://{address}/ping")).await?;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "pong");

    shutdown.trigger();
    let result = timeout(Duration::from_secs(2), server)
        .await
        .expect("serve loop should stop on shutdown")
        .unwrap();
    assert!(result.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_certificate_is_fatal() -> Result<()> {
    install_test_provider();

    let port = pick_free_port();
    let policy = ListenerPolicy::ExplicitCert {
        cert: "/nonexistent/tls.crt".into(),
        key: "/nonexistent/tls.key".into(),
    };

    let shutdown = ShutdownCoordinator::new();
    let result = run_listeners(
        policy,
        &format!("127.0.0.1:{port}"),
        ping_router(),
        &shutdown,
    )
    .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn plaintext_listener_never_answers_tls() -> Result<()> {
    let port = pick_free_port();
    let address = format!("127.0.0.1:{port}");

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let _server = {
        let shutdown = shutdown.clone();
        let address = address.clone();
        tokio::spawn(async move {
            run_listeners(ListenerPolicy::Disabled, &address, ping_router(), &shutdown).await
        })
    };

    let client = reqwest::Client::new();
    let response = get_with_retries(&client, &format!("http://{address}/ping")).await?;
    assert_eq!(response.status(), 200);

    // A TLS handshake against the plaintext port must fail rather than be
    // quietly downgraded.
    let tls_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    assert!(tls_client
        .get(format!("https://{address}/ping"))
        .send()
        .await
        .is_err());

    shutdown.trigger();
    Ok(())
}
