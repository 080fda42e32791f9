// Team debugger console - JSON-RPC front-end over stdio
//
// Drives a TeamDebugger attached to the simulated target

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use team_debugger::DebuggerConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, error, info};

mod demo;
mod handlers;
mod protocol;
mod session;
mod tools;

use handlers::RequestHandler;
use protocol::*;

/// `--config <path>` is the only flag.
fn config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config needs a path")?;
                path = Some(PathBuf::from(value));
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }
    Ok(path)
}

async fn send(stdout: &mut Stdout, response: &JsonRpcResponse) -> Result<()> {
    let response_str = serde_json::to_string(response)?;
    debug!("Sending: {}", response_str);
    stdout.write_all(response_str.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout is reserved for JSON-RPC protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tdb_console=info,team_debugger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match config_path()? {
        Some(path) => DebuggerConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => DebuggerConfig::default(),
    };
    info!("Starting team debugger console ({:?})", config);

    let handler = RequestHandler::new(config);

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    info!("Console ready, waiting for requests...");

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                debug!("Received: {}", line);

                let value = match serde_json::from_str::<Value>(line) {
                    Ok(value) => value,
                    Err(e) => {
                        error!("Parse error: {}", e);
                        send(&mut stdout, &JsonRpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error")).await?;
                        continue;
                    }
                };

                // Requests carry an id, notifications don't
                if value.get("id").is_some() {
                    match serde_json::from_value::<JsonRpcRequest>(value) {
                        Ok(request) => {
                            let response = handler.handle_request(request).await;
                            send(&mut stdout, &response).await?;
                        }
                        Err(e) => {
                            error!("Invalid request: {}", e);
                            let response = JsonRpcResponse::failure(Value::Null, INVALID_REQUEST, "Invalid request");
                            send(&mut stdout, &response).await?;
                        }
                    }
                } else {
                    match serde_json::from_value::<JsonRpcNotification>(value) {
                        Ok(notification) => handler.handle_notification(notification).await,
                        Err(e) => error!("Invalid notification: {}", e),
                    }
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    handler.shut_down().await;
    info!("Team debugger console shutting down");
    Ok(())
}
