//! Command execution.

use crate::Commands;
use colored::Colorize;
use plexrpc_client::Client;
use plexrpc_protocol::InvocationDescriptor;
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Info => match client.connection().server_info() {
            Some(info) => Ok(format!(
                "{}\n  Version: {}\n  Protocol: {}\n  Wire mode: {}\n  Node: {}",
                info.server_name.bold(),
                info.server_version,
                info.protocol_version,
                info.wire_mode,
                info.node_address.to_string().cyan()
            )),
            None => Ok("No handshake information".yellow().to_string()),
        },

        Commands::Call {
            service,
            method,
            args,
            call_id,
        } => {
            let invocation = invocation(&service, &method, &args, call_id)?;
            let result = client.invoke_descriptor(invocation).await?;
            Ok(format_json(&result))
        }

        Commands::Notify {
            service,
            method,
            args,
            call_id,
        } => {
            let invocation = invocation(&service, &method, &args, call_id)?;
            let call_id = invocation.call_id.clone();
            client.notify(invocation).await?;
            Ok(format!(
                "{} {}.{} (call_id: {})",
                "Accepted".green(),
                service.cyan(),
                method.cyan(),
                call_id
            ))
        }

        Commands::Capabilities => {
            let snapshot = client.node_configuration().await?;
            let services = snapshot.external_services();
            let mut output = format!(
                "{} ({})\n",
                format!("Node {}", snapshot.node_address()).bold(),
                snapshot.version_tag()
            );
            if services.is_empty() {
                output.push_str(&"  No external services".yellow().to_string());
            } else {
                for service in services {
                    output.push_str(&format!("  {}\n", service.cyan()));
                }
            }
            Ok(output.trim_end().to_string())
        }
    }
}

fn invocation(
    service: &str,
    method: &str,
    args: &[String],
    call_id: Option<String>,
) -> Result<InvocationDescriptor, Box<dyn std::error::Error>> {
    let args = args
        .iter()
        .map(|a| parse_json_arg(a))
        .collect::<Result<Vec<_>, _>>()?;
    let invocation = InvocationDescriptor::new(service, method, args);
    Ok(match call_id {
        Some(id) => invocation.with_call_id(id),
        None => invocation,
    })
}

/// Parses an argument: inline JSON, @file.json, or a bare string.
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string())))
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
