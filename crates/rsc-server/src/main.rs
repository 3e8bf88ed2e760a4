use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rsc_core::config::DEFAULT_ADDR;
use rsc_core::tls::{fingerprint, load_certs, load_private_key, server_config};
use rsc_server::provider::{LibraryProvider, MemoryToken, MemoryTokenConfig, TokenProvider};
use rsc_server::provision::{ProvisionRequest, provision};
use rsc_server::{ClientRegistry, Server};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "rsc-server",
    version,
    about = "Serves a PKCS#11 token to remote shim clients"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept shim connections and forward their calls to the provider.
    Serve(ServeArgs),
    /// Generate a server certificate and the credentials of one client.
    Configure(ConfigureArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "REMOTESC_ADDR", default_value = DEFAULT_ADDR)]
    addr: String,

    /// PKCS#11 library to load, or `memory` for the built-in software token.
    #[arg(long, env = "REMOTESC_PROVIDER")]
    provider: String,

    /// Allow concurrent calls into the provider library.
    #[arg(long, env = "REMOTESC_PROVIDER_THREAD_SAFE", default_value_t = false)]
    provider_thread_safe: bool,

    /// Server certificate chain in PEM format.
    #[arg(long, env = "REMOTESC_CERT")]
    cert: PathBuf,

    /// Server private key in PEM format.
    #[arg(long = "priv", env = "REMOTESC_PRIV")]
    key: PathBuf,

    /// JSON list of authorised clients (`[{"fingerprint", "secret"}]`).
    #[arg(long, env = "REMOTESC_CLIENTS")]
    clients: Option<PathBuf>,

    /// Fingerprint of a single authorised client.
    #[arg(long, env = "REMOTESC_FINGERPRINT", requires = "secret")]
    fingerprint: Option<String>,

    /// Shared secret of that client.
    #[arg(long, env = "REMOTESC_SECRET", hide_env_values = true, requires = "fingerprint")]
    secret: Option<String>,
}

#[derive(Args, Debug)]
struct ConfigureArgs {
    /// Address clients will connect to.
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// Directory receiving the generated files.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Replace existing files.
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Configure(args) => configure(args),
    }
}

fn load_registry(args: &ServeArgs) -> Result<ClientRegistry> {
    let mut registry = match &args.clients {
        Some(path) => ClientRegistry::from_file(path)?,
        None => ClientRegistry::default(),
    };
    if let (Some(fingerprint), Some(secret)) = (&args.fingerprint, &args.secret) {
        registry.insert(fingerprint, secret)?;
    }
    if registry.is_empty() {
        bail!("no authorised clients; pass --clients or --fingerprint with --secret");
    }
    Ok(registry)
}

fn load_provider(args: &ServeArgs) -> Result<Arc<dyn TokenProvider>> {
    if args.provider == "memory" {
        info!("using the built-in memory token");
        return Ok(Arc::new(MemoryToken::new(MemoryTokenConfig::default())));
    }
    let path = PathBuf::from(&args.provider);
    let provider = LibraryProvider::load(&path, args.provider_thread_safe)
        .with_context(|| format!("failed to load provider {}", path.display()))?;
    Ok(Arc::new(provider))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let registry = load_registry(&args)?;
    let certs = load_certs(&args.cert)?;
    let key = load_private_key(&args.key)?;
    if let Some(leaf) = certs.first() {
        info!(pin = %fingerprint(leaf), "server certificate loaded");
    }
    let tls = server_config(certs, key)?;
    let provider = load_provider(&args)?;

    let server = Server::bind(&args.addr, tls, registry, provider).await?;
    server.run(shutdown_signal()).await
}

fn configure(args: ConfigureArgs) -> Result<()> {
    let out = provision(&ProvisionRequest {
        addr: args.addr,
        out_dir: args.out_dir,
        overwrite: args.force,
    })?;
    info!(
        cert = %out.cert.display(),
        key = %out.key.display(),
        clients = %out.clients.display(),
        "server material written"
    );
    println!("{}", out.client_json);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
