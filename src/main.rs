//! Cert Injector - ACME certificates for annotated Kubernetes Services

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cert_injector::challenge::resolver::{resolver_router, ResolverConfig};
use cert_injector::challenge::router::{RouterConfig, DEFAULT_RESOLVER_IMAGE};
use cert_injector::controller::{error_policy, reconcile, Context};
use cert_injector::issuer::IssuerConfig;
use cert_injector::webhook::webhook_router;
use cert_injector::{DEFAULT_RESOLVER_PORT, DEFAULT_WEBHOOK_PORT, RENEW_BEFORE};

/// Cert Injector - issue, renew and mount ACME certificates for Services
#[derive(Parser, Debug)]
#[command(name = "cert-injector", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the certificate controller (default mode)
    Controller(ControllerArgs),

    /// Serve the mutating admission webhook over TLS
    Injector(InjectorArgs),

    /// Answer one HTTP-01 challenge
    ///
    /// Runs inside the temporary pod the controller creates while a
    /// challenge is being validated.
    Resolver(ResolverArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Image of the temporary challenge resolver pod
    #[arg(long, env = "RESOLVER_CUSTOM_IMAGE", default_value = DEFAULT_RESOLVER_IMAGE)]
    resolver_image: String,

    /// Seconds to wait after routing traffic to the resolver
    #[arg(long, env = "PROPAGATION_WAIT_SECS", default_value = "45")]
    propagation_wait_secs: u64,

    /// Seconds to wait before placing an order
    #[arg(long, env = "PRE_OBTAIN_WAIT_SECS", default_value = "45")]
    pre_obtain_wait_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            resolver_image: DEFAULT_RESOLVER_IMAGE.to_string(),
            propagation_wait_secs: 45,
            pre_obtain_wait_secs: 45,
        }
    }
}

#[derive(Args, Debug)]
struct InjectorArgs {
    /// PEM certificate chain for the webhook listener
    #[arg(long, env = "CERT_PATH", default_value = "/tmp/certs/tls.crt")]
    cert_path: PathBuf,

    /// PEM private key for the webhook listener
    #[arg(long, env = "KEY_PATH", default_value = "/tmp/certs/tls.key")]
    key_path: PathBuf,

    /// Listen port
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,
}

#[derive(Args, Debug)]
struct ResolverArgs {
    /// Domain being validated
    #[arg(long, env = "DOMAIN_NAME")]
    domain: String,

    /// Challenge token
    #[arg(long, env = "TOKEN")]
    token: String,

    /// Key authorization served as the response body
    #[arg(long, env = "AUTH_KEY")]
    auth_key: String,

    /// Listen port
    #[arg(long, env = "PORT", default_value_t = DEFAULT_RESOLVER_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Injector(args)) => run_injector(args).await,
        Some(Commands::Resolver(args)) => run_resolver(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

/// Run the certificate controller until a shutdown signal
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {e}"))?;

    let config = IssuerConfig {
        router: RouterConfig {
            resolver_image: args.resolver_image,
            propagation_wait: Duration::from_secs(args.propagation_wait_secs),
        },
        pre_obtain_wait: Duration::from_secs(args.pre_obtain_wait_secs),
        renew_before: RENEW_BEFORE,
    };
    let ctx = Arc::new(Context::builder(client.clone()).issuer_config(config).build());
    let services: Api<Service> = Api::all(client);

    tracing::info!("Starting certificate controller (issuance and renewal)...");

    Controller::new(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "certificate reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "certificate reconciliation error"),
            }
        })
        .await;

    tracing::info!("certificate controller shutting down");
    Ok(())
}

/// Serve the admission webhook over TLS
async fn run_injector(args: InjectorArgs) -> anyhow::Result<()> {
    let tls_config =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(&args.cert_path, &args.key_path)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "failed to load webhook TLS material {:?}/{:?}: {e}",
                    args.cert_path,
                    args.key_path
                )
            })?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, "starting admission webhook");
    axum_server::bind_rustls(addr, tls_config)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {e}"))
}

/// Serve a single HTTP-01 answer until the pod is deleted
async fn run_resolver(args: ResolverArgs) -> anyhow::Result<()> {
    let config = Arc::new(ResolverConfig {
        domain: args.domain,
        token: args.token,
        key_authorization: args.auth_key,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, domain = %config.domain, "starting challenge resolver");

    axum::serve(listener, resolver_router(config))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| anyhow::anyhow!("resolver server error: {e}"))
}
