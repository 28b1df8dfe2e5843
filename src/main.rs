use std::sync::Arc;

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use vaultgate::{
    adapters::{
        ApiContext, DevBackend, VaultHttpClient, build_app, dev_backend::DEV_RUNTIME_PATH,
        run_listeners,
    },
    config::{ServiceConfig, ServiceConfigValidator, load_config},
    core::{
        Credential, CsrfProtect, RuntimeHandle, Session, runtime::spawn_refresh, select_policy,
        session::spawn_renewal,
    },
    metrics,
    ports::backend::BackendClient,
    tracing_setup,
    utils::ShutdownCoordinator,
};

/// Secure bootstrap and listener front end for a secrets-management web UI.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Run against an embedded, in-memory development backend
    #[clap(long)]
    dev: bool,

    /// Single-use wrapped token to redeem for the service's session
    #[clap(long, default_value = "")]
    token: String,

    /// Configuration file (TOML, YAML or JSON by extension)
    #[clap(short, long, default_value = "vaultgate.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    if args.dev {
        tracing_setup::init_console_tracing();
    } else {
        tracing_setup::init_tracing();
    }
    metrics::init_metrics();

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed; TLS listeners \
            will use whichever provider is in place.",
            e
        );
    }

    if args.dev && std::env::var_os("VAULTGATE_PRODUCTION").is_some() {
        return Err(eyre!(
            "--dev is refused while VAULTGATE_PRODUCTION is set; unset it to run a development instance"
        ));
    }

    // The signal handler runs for the whole process lifetime: first
    // SIGINT/SIGTERM broadcasts shutdown, waits out the grace period and
    // exits 0.
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move { signal_shutdown.run_signal_handler().await });

    // Resolve configuration and the startup credential. --dev replaces both
    // with an embedded backend and a wrapped token minted against it.
    let (config, credential) = if args.dev {
        let backend = DevBackend::spawn()
            .await
            .context("Failed to start embedded dev backend")?;
        print_dev_banner(&backend);
        let config = ServiceConfig::dev(&backend.address(), DEV_RUNTIME_PATH);
        let credential = Credential::WrappedToken(backend.wrapping_token().to_string());
        backend.shutdown_on(&shutdown);
        (config, credential)
    } else {
        tracing::info!(path = %args.config, "loading configuration");
        let config = load_config(&args.config)
            .await
            .with_context(|| format!("Failed to load configuration from {}", args.config))?;
        ServiceConfigValidator::validate(&config)?;
        let credential = Credential::from_startup(Some(args.token), &config.vault)?;
        (config, credential)
    };

    let client: Arc<dyn BackendClient> =
        Arc::new(VaultHttpClient::new(&config.vault).context("Failed to build backend client")?);

    tracing::info!(backend = %config.vault.address, "authenticating service to backend");
    let session = Arc::new(
        Session::authenticate(client.as_ref(), &config.vault.approle_login, credential)
            .await
            .context("Backend authentication failed")?,
    );
    spawn_renewal(session.clone(), client.clone(), shutdown.subscribe());

    let runtime = Arc::new(
        RuntimeHandle::load_initial(client.as_ref(), &session, &config.vault.runtime_config)
            .await
            .context("Failed to load runtime settings from the backend")?,
    );
    let refresh_every = humantime::parse_duration(&config.vault.runtime_refresh)
        .context("Invalid vault.runtime_refresh")?;
    spawn_refresh(
        runtime.clone(),
        client.clone(),
        session.clone(),
        refresh_every,
        shutdown.subscribe(),
    );

    let policy = select_policy(&config.listener);
    let hardened = policy.tls_active();

    let context = ApiContext {
        backend: client,
        session,
        runtime,
        csrf: Arc::new(CsrfProtect::new()),
        secure_cookies: hardened,
    };
    let app = build_app(context, &config.listener.static_root, hardened)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.listener.address,
        policy = policy.name(),
        "vaultgate bootstrapped"
    );
    println!(
        "Vaultgate {} bootstrapped (listener: {}, TLS policy: {})",
        env!("CARGO_PKG_VERSION"),
        config.listener.address,
        policy.name()
    );

    run_listeners(policy, &config.listener.address, app, &shutdown).await
}

/// The dev credentials are meant to be copy-pasted into a browser login, so
/// they go to stdout rather than the structured log.
fn print_dev_banner(backend: &DevBackend) {
    println!();
    println!("======================================");
    println!("Starting vaultgate in development mode");
    println!("Embedded backend: {}", backend.address());
    println!("Root token:       {}", backend.root_token());
    println!("Wrapping token:   {}", backend.wrapping_token());
    println!("All state is in memory and lost on exit.");
    println!("======================================");
    println!();
}
