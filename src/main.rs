//! Hive Bridge Server
//!
//! WebSocket bridge for LLM drone colonies. Hosts one or more named colonies
//! and lets remote clients hatch, prompt and retire drones.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hive_bridge::config::{BridgeConfig, ColonyOptions, LlmProvider, CONFIG_FILE};
use hive_bridge::host::{ColonyPlugin, Host};
use hive_bridge::server::{ServerConfig, WebSocketServer};

/// Hive Bridge Server
///
/// WebSocket bridge for LLM drone colonies
#[derive(Parser, Debug)]
#[command(name = "hive-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Authentication token for remote connections
    #[arg(long)]
    token: Option<String>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Colony configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// API key for a default colony when the config file declares none
    #[arg(long, env = "HIVE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Provider for the default colony
    #[arg(long, default_value_t = LlmProvider::Claude)]
    provider: LlmProvider,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Hive Bridge v{}", env!("CARGO_PKG_VERSION"));

    let host = Arc::new(Host::new());
    register_colonies(&host, &args).await?;

    if args.token.is_some() {
        info!("Token authentication enabled");
    }

    // Create server configuration
    let config = ServerConfig::new(args.bind, args.port).with_token(args.token);

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config, host));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Register the colonies declared in the config file, or a default one
async fn register_colonies(host: &Host, args: &Args) -> anyhow::Result<()> {
    let bridge = BridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    for entry in bridge.colonies {
        let (name, options) = entry.into_parts();
        let mut plugin = ColonyPlugin::new(options);
        if let Some(name) = name {
            plugin = plugin.with_decorator_name(name);
        }
        host.register(plugin).await?;
    }

    if host.names().await.is_empty() {
        match &args.api_key {
            Some(key) => {
                let options = ColonyOptions::new(key.clone()).with_provider(args.provider);
                host.register(ColonyPlugin::new(options)).await?;
            }
            None => warn!(
                "No colonies configured; set HIVE_API_KEY or add [[colony]] to {}",
                args.config.display()
            ),
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
