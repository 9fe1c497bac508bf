//! HPA Agent CLI Entry Point
//!
//! This is the main entry point for the HPA agent binary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hpa_agent::agent::dispatch::Handlers;
use hpa_agent::agent::supervisor::ReconnectSupervisor;
use hpa_agent::cli::config::{default_cluster_name, Config, LoggingConfig};
use hpa_agent::connection::grpc::AgentServiceClient;
use hpa_agent::connection::protocol::{ClusterInfo, MessageFactory, RegisterClusterRequest};

/// Upper bound on the whole registration call
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hpa-agent")]
#[command(author, version, about = "HPA Agent - keeps a cluster connected to the HPA control plane")]
struct Cli {
    /// Path to a TOML configuration file; environment variables override it
    #[arg(short, long, env = "HPA_AGENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent (default)
    Start,
    /// Register this cluster and print its credentials
    Register {
        /// Cluster name (defaults to the hostname)
        #[arg(short, long)]
        name: Option<String>,

        /// Cluster region (defaults to CLUSTER_REGION)
        #[arg(long)]
        region: Option<String>,

        /// Cloud provider (defaults to CLUSTER_PROVIDER)
        #[arg(long)]
        provider: Option<String>,

        /// Label as key=value; may be repeated
        #[arg(short, long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Validate the configuration and print it with secrets redacted
    CheckConfig {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Start);
    if let Commands::Version = command {
        show_version();
        return Ok(());
    }

    let config = Config::resolve(cli.config.as_deref())?;
    init_logging(&config.logging, cli.verbose)?;

    match command {
        Commands::Start => start_agent(config).await?,
        Commands::Register {
            name,
            region,
            provider,
            labels,
        } => register_cluster(&config, name, region, provider, labels).await?,
        Commands::CheckConfig { json } => check_config(&config, json)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .with_context(|| format!("Invalid log level: {}", logging.level))?
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    match logging.format.as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        "compact" => tracing::subscriber::set_global_default(builder.compact().finish())?,
        _ => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }
    Ok(())
}

async fn start_agent(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let identity = Arc::new(config.identity()?);
    let supervisor_config = config.supervisor_config()?;
    let connector = config.transport()?;

    info!(
        cluster_id = %identity.cluster_id,
        tenant_id = %identity.tenant_id,
        agent_version = %identity.agent_version,
        endpoint = %config.control_plane.endpoint,
        tls = connector.tls().mode_name(),
        heartbeat = ?supervisor_config.heartbeat_interval,
        token = %identity.token_fingerprint(),
        "Starting HPA agent"
    );

    let supervisor = ReconnectSupervisor::new(
        connector,
        MessageFactory::system(identity),
        Handlers::default(),
        supervisor_config,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    supervisor.run(shutdown).await.context("Agent terminated")?;
    info!("Agent stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C, shutting down");
    }

    shutdown.cancel();
}

async fn register_cluster(
    config: &Config,
    name: Option<String>,
    region: Option<String>,
    provider: Option<String>,
    labels: Vec<(String, String)>,
) -> Result<()> {
    config
        .validate_connection()
        .context("Invalid connection configuration")?;
    let Some(tenant_id) = config.cluster.tenant_id.clone().filter(|t| !t.is_empty()) else {
        bail!("TENANT_ID is required to register a cluster");
    };

    let region = region.or_else(|| config.cluster.region.clone()).unwrap_or_default();
    let provider = provider
        .or_else(|| config.cluster.provider.clone())
        .unwrap_or_default();
    let request = RegisterClusterRequest {
        name: name.unwrap_or_else(default_cluster_name),
        tenant_id,
        region: region.clone(),
        provider: provider.clone(),
        labels: labels.into_iter().collect::<HashMap<_, _>>(),
        cluster_info: Some(ClusterInfo {
            kubernetes_version: config.cluster.kubernetes_version.clone(),
            provider,
            region,
        }),
    };
    info!(name = %request.name, tenant_id = %request.tenant_id, "Registering cluster");

    let transport = config.transport()?;
    let response = tokio::time::timeout(REGISTER_TIMEOUT, async {
        let channel = transport
            .channel()
            .await
            .context("Failed to connect to control plane")?;
        let response = AgentServiceClient::new(channel)
            .register_cluster(request)
            .await
            .context("Failed to register cluster")?;
        anyhow::Ok(response.into_inner())
    })
    .await
    .with_context(|| format!("Registration did not complete within {:?}", REGISTER_TIMEOUT))??;

    info!(cluster_id = %response.cluster_id, "Cluster registered");
    println!("CLUSTER_ID={}", response.cluster_id);
    println!("AGENT_TOKEN={}", response.agent_token);
    Ok(())
}

fn check_config(config: &Config, json: bool) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let redacted = config.redacted();
    let rendered = if json {
        serde_json::to_string_pretty(&redacted).context("Failed to serialize configuration")?
    } else {
        toml::to_string_pretty(&redacted).context("Failed to serialize configuration")?
    };
    println!("{}", rendered);
    Ok(())
}

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("invalid label '{}', expected key=value", s)),
    }
}

fn show_version() {
    println!("hpa-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Cluster agent for the HPA control plane");
    println!();
    println!("Features:");
    println!("  - Authenticated bidirectional gRPC session");
    println!("  - Status heartbeat");
    println!("  - Auto-reconnection with exponential backoff");
    println!("  - TLS and mutual TLS");
}
