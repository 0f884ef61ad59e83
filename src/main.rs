//! plexrpcd - plexrpc node daemon
//!
//! Serves the built-in controllers over every configured transport and joins
//! the cluster named by the seed list.

use plexrpc_server::{builtin, Config, Node};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if PLEXRPC_CONFIG is set, then env overrides)
    let config_path = std::env::var("PLEXRPC_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting plexrpc node");
    tracing::info!(
        "  Socket: {} ({:?} mode)",
        config.network.bind_addr,
        config.network.mode
    );
    if config.http.enabled {
        tracing::info!("  HTTP: {}", config.http.bind_addr);
    } else {
        tracing::info!("  HTTP: disabled");
    }
    if config.cluster.enabled {
        tracing::info!("  Cluster: enabled ({} seed(s))", config.cluster.seeds.len());
    } else {
        tracing::info!("  Cluster: disabled");
    }
    if config.metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
    }

    let node = Node::start(config, builtin::catalog()).await?;

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal, stopping node...");
    node.shutdown();
    node.wait().await;

    tracing::info!("Node stopped");
    Ok(())
}
