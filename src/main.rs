// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Main entry point for the busnode command line
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use busnode::bus::{DispatchExit, DispatchHandle, DispatchLoop, Node};
use busnode::config::Config;
use busnode::engine_core::constants::mcp;
use busnode::engine_core::models::InboundMessage;
use busnode::mcp::{relay, McpClientBridge, McpPublishBridge};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Node identity on the bus
    #[arg(long, global = true)]
    node_id: Option<String>,

    /// Daemon address, overrides TAGENTACLE_DAEMON_URL
    #[arg(long, global = true)]
    daemon_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the MCP publish bridge
    Bridge {
        /// Allowed topic prefixes; none means every topic is allowed
        allowed_prefixes: Vec<String>,
    },
    /// Publish one message and exit
    Publish {
        topic: String,
        /// JSON payload
        payload: String,
    },
    /// Call a service and print its response
    Call {
        service: String,
        /// JSON payload
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print messages received on the given topics as JSON lines
    Listen {
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Relay an MCP session on stdio to a server node over the bus
    Proxy {
        /// Node id of the MCP server
        server_node_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    install_panic_hook();

    let mut config = Config::from_env().unwrap_or_else(|e| {
        eprintln!(
            "Warning: Failed to load config from env, using defaults: {}",
            e
        );
        Config::default()
    });
    if let Some(url) = &cli.daemon_url {
        config = config.with_daemon_url(url.clone());
    }

    if let Err(e) = init_tracing(&config) {
        eprintln!("Failed to init tracing: {}", e);
    }

    let node_id = cli.node_id.clone().unwrap_or_else(|| match &cli.command {
        Command::Bridge { .. } => mcp::DEFAULT_PUBLISH_BRIDGE_NODE_ID.to_string(),
        _ => format!("busnode-cli-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
    });
    let node = Node::new(node_id, config);

    match cli.command {
        Command::Bridge { allowed_prefixes } => {
            let allowed = (!allowed_prefixes.is_empty()).then_some(allowed_prefixes);
            McpPublishBridge::start(&node, allowed).await?;
            node.connect().await?;
            let exit = spin_until_ctrl_c(&node).await?;
            info!("Publish bridge exited: {:?}", exit);
        }
        Command::Publish { topic, payload } => {
            let payload = parse_payload(&payload)?;
            node.connect().await?;
            node.publish(topic.as_str(), payload).await?;
            info!(topic = %topic, "Published");
            node.close().await;
        }
        Command::Call {
            service,
            payload,
            timeout_ms,
        } => {
            let payload = parse_payload(&payload)?;
            node.connect().await?;
            let (dispatch, handle) = node.dispatcher()?;
            let running = tokio::spawn(dispatch.run());

            let result = node
                .call_service(service.as_str(), payload, timeout_ms.map(Duration::from_millis))
                .await;
            handle.shutdown();
            let _ = running.await;

            let response = result.with_context(|| format!("Call to '{}' failed", service))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Listen { topics } => {
            for topic in topics {
                node.subscribe(topic, |message: InboundMessage| async move {
                    let line = json!({
                        "topic": message.topic,
                        "sender": message.sender,
                        "payload": message.payload,
                    });
                    println!("{}", line);
                    anyhow::Ok(())
                })
                .await?;
            }
            node.connect().await?;
            let exit = spin_until_ctrl_c(&node).await?;
            info!("Listener exited: {:?}", exit);
        }
        Command::Proxy { server_node_id } => {
            node.connect().await?;
            let (dispatch, handle) = node.dispatcher()?;
            let running = tokio::spawn(dispatch.run());

            let (bridge, session) = McpClientBridge::connect(&node, &server_node_id)?;
            info!(service = %bridge.target(), "Relaying MCP session over stdio");
            if let Err(e) = relay(tokio::io::stdin(), tokio::io::stdout(), session).await {
                warn!("Relay ended with error: {:#}", e);
            }

            handle.shutdown();
            let _ = running.await;
            bridge.close().await;
        }
    }

    Ok(())
}

fn parse_payload(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Payload is not valid JSON: {}", raw))
}

/// Run the dispatch loop; Ctrl-C requests a graceful drain.
async fn spin_until_ctrl_c(node: &Node) -> Result<DispatchExit> {
    let (dispatch, handle): (DispatchLoop, DispatchHandle) = node.dispatcher()?;
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_handle.shutdown();
        }
    });
    Ok(dispatch.run().await)
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC: {} at {}", message, location);
    }));
}

fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("busnode=debug,info"));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
