//! VIP Operator
//!
//! This binary runs the endpoint-triggered VIP election for the node it is deployed on.

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vip_operator::{OperatorConfig, VipOperator};

#[derive(Parser, Debug)]
#[clap(
    name = "vip-operator",
    version,
    about = "Runs VIP leader election for Services with endpoints on this node"
)]
struct Args {
    /// Config file path
    #[clap(short, long, default_value = "/etc/vip-operator/config.yaml")]
    config: String,

    /// Namespace to watch (empty for all namespaces)
    #[clap(short, long)]
    namespace: Option<String>,

    /// Name of this node (defaults to $HOSTNAME)
    #[clap(long)]
    node_name: Option<String>,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<OperatorConfig> {
        let mut config = if std::path::Path::new(&self.config).exists() {
            info!("Loading configuration from {}", self.config);
            OperatorConfig::from_file(&self.config)?
        } else {
            info!("Using default configuration");
            OperatorConfig::default()
        };

        if let Some(namespace) = self.namespace {
            config.namespace = Some(namespace);
        }
        if let Some(node_name) = self.node_name {
            config.node_name = node_name;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Cancel `shutdown` once `signal` fires. A signal listener that fails to
/// install leaves the operator running.
async fn forward_shutdown(
    signal: impl std::future::Future<Output = std::io::Result<()>>,
    shutdown: CancellationToken,
) {
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
        Err(e) => error!("Unable to listen for shutdown signal: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "vip_operator={},kube={}",
                    log_level, log_level
                ))
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting VIP operator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;
    let operator = VipOperator::new(config).await?;

    // Handle shutdown gracefully
    let shutdown = CancellationToken::new();
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown.clone()));

    if let Err(e) = operator.run(shutdown).await {
        error!("Operator error: {}", e);
        std::process::exit(1);
    }

    info!("VIP operator stopped");
    Ok(())
}
