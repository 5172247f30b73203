use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use stopper::Stopper;

use kube_graffiti::{
    config::{Config, Registry},
    existing, handler, healthcheck,
    nscache::{NamespaceCache, NamespaceLookup},
    registrar,
};

#[derive(Parser, Debug)]
#[command(about = "Mutating admission webhook that paints labels and annotations onto matching objects")]
struct Cli {
    /// Path to the rules configuration file
    #[arg(long, short)]
    config: PathBuf,
    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
    /// Also apply rules to objects that already exist in the cluster
    #[arg(long)]
    check_existing: bool,
}

/// Generate future that awaits shutdown signal
async fn shutdown_signal(axum_server_handle: axum_server::Handle, stopper: Stopper) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("terminate signal received");

    stopper.stop();
    axum_server_handle.graceful_shutdown(Some(std::time::Duration::from_secs(30)));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).context("failed to load configuration")?;
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }
    if cli.check_existing {
        config.check_existing = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(
                    config
                        .log_level
                        .parse()
                        .context("invalid log level in configuration")?,
                )
                .from_env_lossy(),
        )
        .compact()
        .init();

    let registry = Arc::new(Registry::new(&config).context("invalid rule set")?);
    tracing::info!(rules = registry.rules().len(), "loaded rule set");

    let kube_config = kube::Config::infer().await?;
    let client: kube::Client = kube_config.try_into()?;

    // Namespace cache feeding namespace-selector evaluation
    let stopper = Stopper::new();
    let (namespace_cache, namespace_cache_handle) = NamespaceCache::start(client.clone(), &stopper);
    let namespaces: Arc<dyn NamespaceLookup> = Arc::new(namespace_cache);

    // Advertise one webhook configuration per rule before serving
    registrar::register_rules(client.clone(), &config, &registry)
        .await
        .context("failed to register webhooks")?;

    // Prepare HTTP apps
    let http_app = handler::create_app(registry.clone(), namespaces.clone());
    let health_app = healthcheck::create_app(client.clone(), &config.health_checker.path);

    // Prepare TLS config for HTTPS serving
    let tls_config = RustlsConfig::from_pem_file(&config.server.cert_path, &config.server.key_path)
        .await
        .context("failed to load TLS certificate")?;

    // Prepare shutdown signal futures
    let axum_server_handle = axum_server::Handle::new();
    let shutdown_signal_fut = shutdown_signal(axum_server_handle.clone(), stopper.clone());
    tokio::spawn(async move {
        shutdown_signal_fut.await;
    });

    // Spawn health server
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_checker.port));
    let health_handle = tokio::spawn(
        axum_server::bind(health_addr).serve(health_app.into_make_service()),
    );

    // Spawn HTTPS webhook server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!(%addr, "starting webhook server");
    let server_handle = tokio::spawn(
        axum_server::bind_rustls(addr, tls_config)
            .handle(axum_server_handle)
            .serve(http_app.into_make_service()),
    );

    // Sweep objects that already exist, now that the webhook is live
    let existing_handle = if config.check_existing {
        Some(tokio::spawn(existing::check_existing(
            client.clone(),
            registry.clone(),
            namespaces.clone(),
            config.check_existing_workers,
            stopper.clone(),
        )))
    } else {
        None
    };

    server_handle.await??;
    tracing::info!("webhook server terminated");

    if let Some(existing_handle) = existing_handle {
        if let Err(error) = existing_handle.await? {
            tracing::error!(%error, "existing object check failed");
        }
    }
    health_handle.abort();
    namespace_cache_handle.await?;

    Ok(())
}
