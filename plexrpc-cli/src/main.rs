//! plexrpc-cli - Command-line interface for plexrpc nodes
//!
//! One-shot calls against a node's socket listener.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use plexrpc_client::{Client, ConnectionConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plexrpc-cli")]
#[command(about = "Command-line interface for plexrpc nodes")]
#[command(version)]
struct Cli {
    /// Node socket address
    #[arg(short, long, default_value = "127.0.0.1:7411", env = "PLEXRPC_SERVER")]
    server: SocketAddr,

    /// Call attribute sent with the handshake (repeatable)
    #[arg(short, long = "attr", value_name = "KEY=VALUE", value_parser = parse_attribute)]
    attributes: Vec<(String, String)>,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the node
    Ping,

    /// Show what the node reported during the handshake
    Info,

    /// Invoke a method and print its result
    Call {
        /// Service name
        service: String,

        /// Method name
        method: String,

        /// Arguments, one JSON value each (or @file.json); bare words are sent as strings
        args: Vec<String>,

        /// Call id (generated if omitted)
        #[arg(long)]
        call_id: Option<String>,
    },

    /// Send a one-way invocation
    Notify {
        /// Service name
        service: String,

        /// Method name
        method: String,

        /// Arguments, one JSON value each (or @file.json); bare words are sent as strings
        args: Vec<String>,

        /// Call id (generated if omitted)
        #[arg(long)]
        call_id: Option<String>,
    },

    /// Print the node's capability snapshot
    Capabilities,
}

fn parse_attribute(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ConnectionConfig::new(cli.server)
        .with_client_name("plexrpc-cli")
        .with_request_timeout(Duration::from_secs(cli.timeout));
    for (key, value) in cli.attributes {
        config = config.with_attribute(key, value);
    }
    let client = Client::new(config);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    match commands::execute(&client, cli.command).await {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            let _ = client.close().await;
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
