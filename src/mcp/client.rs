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

//! MCP client bridge.
//!
//! Every request the local session sends becomes a correlated service call
//! to the server node's `/mcp/<node-id>/rpc`; the answer is fed back to the
//! session. Several calls may be in flight, each with its own request id.

use std::future::Future;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::node::Node;
use crate::engine_core::constants::{jsonrpc, mcp};
use crate::engine_core::errors::BusError;
use crate::engine_core::models::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::transport::{session_pair, SessionChannels};

/// Client side of an MCP session carried over the bus.
pub struct McpClientBridge {
    node: Node,
    target: String,
    shutdown: CancellationToken,
}

impl McpClientBridge {
    /// Bind a session to the server running on `server_node_id`. The node
    /// must be connected and its dispatch loop running for answers to arrive.
    pub fn connect(node: &Node, server_node_id: &str) -> Result<(Self, SessionChannels), BusError> {
        if !node.is_connected() {
            return Err(BusError::NotConnected);
        }
        let target = mcp::rpc_service(server_node_id);
        let (session, bridge) = session_pair();
        let shutdown = CancellationToken::new();

        tokio::spawn(pump_requests(
            node.clone(),
            target.clone(),
            bridge.inbound,
            bridge.outbound,
            shutdown.clone(),
            node.closed(),
        ));
        info!(service = %target, "MCP client bridge ready");

        Ok((
            Self {
                node: node.clone(),
                target,
                shutdown,
            },
            session,
        ))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// End the session and close the node's connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.node.close().await;
    }
}

async fn pump_requests(
    node: Node,
    target: String,
    inbound: mpsc::Sender<JsonRpcMessage>,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    shutdown: CancellationToken,
    connection_closed: impl Future<Output = ()>,
) {
    tokio::pin!(connection_closed);
    let mut calls = JoinSet::new();
    let mut accepting = true;

    loop {
        if !accepting && calls.is_empty() {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                calls.abort_all();
                break;
            }
            _ = &mut connection_closed => {
                debug!("Bus connection ended, closing MCP session");
                calls.abort_all();
                break;
            }
            Some(_) = calls.join_next(), if !calls.is_empty() => {}
            message = outbound.recv(), if accepting => match message {
                Some(JsonRpcMessage::Request(request)) => {
                    let node = node.clone();
                    let target = target.clone();
                    let inbound = inbound.clone();
                    calls.spawn(async move {
                        let response = call(&node, &target, request).await;
                        if inbound.send(JsonRpcMessage::Response(response)).await.is_err() {
                            debug!("Session closed before the response arrived");
                        }
                    });
                }
                Some(JsonRpcMessage::Notification(note)) => {
                    match serde_json::to_value(&note) {
                        Ok(payload) => {
                            if let Err(e) = node.notify_service(target.as_str(), payload).await {
                                warn!(method = %note.method, "Notification not delivered: {}", e);
                            }
                        }
                        Err(e) => warn!("Could not encode notification: {}", e),
                    }
                }
                Some(JsonRpcMessage::Response(response)) => {
                    // Answers to server-initiated requests have no return path.
                    warn!(id = %response.id, "Dropping client response; not supported over the bus");
                }
                None => {
                    debug!(in_flight = calls.len(), "Session finished sending, waiting for answers");
                    accepting = false;
                }
            },
        }
    }
    // Dropping `inbound` here ends the session's incoming stream.
}

/// One request/response exchange. Failures become JSON-RPC errors carrying
/// the request's id so the session never waits forever.
async fn call(node: &Node, target: &str, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone().unwrap_or(Value::Null);
    let payload = match serde_json::to_value(&request) {
        Ok(payload) => payload,
        Err(e) => return JsonRpcResponse::error(id, jsonrpc::ERROR_INTERNAL, e.to_string()),
    };

    match node.call_service(target, payload, None).await {
        Ok(value) => match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(mut response) => {
                response.id = id;
                response
            }
            Err(e) => {
                warn!(method = %request.method, "Malformed response from MCP server: {}", e);
                JsonRpcResponse::error(
                    id,
                    jsonrpc::ERROR_INTERNAL,
                    format!("Malformed response from server: {}", e),
                )
            }
        },
        Err(e) => {
            warn!(method = %request.method, service = %target, "MCP call failed: {}", e);
            JsonRpcResponse::error(id, jsonrpc::ERROR_TRANSPORT, e.user_message())
        }
    }
}
