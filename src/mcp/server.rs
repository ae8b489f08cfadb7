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

//! MCP server bridge.
//!
//! Serves a local JSON-RPC session on the service `/mcp/<node-id>/rpc`. Each
//! inbound `call_service` payload is one request or notification for the
//! session; the session's response becomes the `service_response` payload.
//!
//! Request ids are rewritten to bridge-local ids before reaching the session
//! so that two callers using the same JSON-RPC id never collide.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::node::Node;
use crate::bus::registry::ServiceHandler;
use crate::engine_core::constants::{jsonrpc, mcp};
use crate::engine_core::errors::BusError;
use crate::engine_core::models::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::transport::{session_pair, SessionChannels};
use crate::utils::time;

type Waiters = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

struct ServerState {
    node: Node,
    service: String,
    inbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    waiters: Mutex<Waiters>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ServerState {
    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Option<mpsc::Sender<JsonRpcMessage>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// End the session stream and release every caller still waiting.
    fn close_session(&self) {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.waiters().clear();
        self.shutdown.cancel();
    }

    async fn publish_traffic(&self, request: &JsonRpcRequest, response: &JsonRpcResponse) {
        let record = json!({
            "server": self.node.node_id(),
            "service": self.service,
            "request": request,
            "response": response,
            "timestamp": time::timestamp(),
        });
        if let Err(e) = self.node.publish(mcp::MCP_TRAFFIC_TOPIC, record).await {
            debug!("Traffic record not published: {}", e);
        }
    }
}

struct RpcService {
    state: Arc<ServerState>,
}

#[async_trait]
impl ServiceHandler for RpcService {
    async fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
        let message = match JsonRpcMessage::from_value(payload.clone()) {
            Ok(message) => message,
            Err(e) => {
                let id = payload.get("id").cloned().unwrap_or(Value::Null);
                let response =
                    JsonRpcResponse::error(id, jsonrpc::ERROR_INVALID_REQUEST, format!("Invalid Request: {}", e));
                return Ok(serde_json::to_value(response)?);
            }
        };

        match message {
            JsonRpcMessage::Notification(note) => {
                if let Some(session) = self.state.session() {
                    if session.send(JsonRpcMessage::Notification(note)).await.is_err() {
                        debug!("Session closed, notification dropped");
                    }
                }
                Ok(Value::Null)
            }
            JsonRpcMessage::Request(request) => {
                let response = self.forward(request.clone()).await;
                self.state.publish_traffic(&request, &response).await;
                Ok(serde_json::to_value(response)?)
            }
            JsonRpcMessage::Response(response) => {
                warn!(service = %self.state.service, "Unexpected JSON-RPC response on server bridge");
                let reply = JsonRpcResponse::error(
                    response.id,
                    jsonrpc::ERROR_INVALID_REQUEST,
                    "Invalid Request: server bridge accepts requests and notifications only",
                );
                Ok(serde_json::to_value(reply)?)
            }
        }
    }

    fn name(&self) -> &str {
        "mcp-server-bridge"
    }
}

impl RpcService {
    /// Hand the request to the session under a local id and wait for its
    /// answer. The caller's id is restored on the way back.
    async fn forward(&self, mut request: JsonRpcRequest) -> JsonRpcResponse {
        let original_id = request.id.clone().unwrap_or(Value::Null);
        let Some(session) = self.state.session() else {
            return session_closed(original_id);
        };

        let local_id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.state.waiters().insert(local_id, tx);
        request.id = Some(json!(local_id));

        if session.send(JsonRpcMessage::Request(request)).await.is_err() {
            self.state.waiters().remove(&local_id);
            return session_closed(original_id);
        }
        drop(session);

        match rx.await {
            Ok(mut response) => {
                response.id = original_id;
                response
            }
            Err(_) => session_closed(original_id),
        }
    }
}

fn session_closed(id: Value) -> JsonRpcResponse {
    JsonRpcResponse::error(id, jsonrpc::ERROR_TRANSPORT, "MCP session closed")
}

/// Server side of an MCP session carried over the bus.
pub struct McpServerBridge {
    state: Arc<ServerState>,
}

impl McpServerBridge {
    /// Register `/mcp/<node-id>/rpc` on a connected node and return the
    /// channels the local MCP session runs on.
    pub async fn start(node: &Node) -> Result<(Self, SessionChannels), BusError> {
        if !node.is_connected() {
            return Err(BusError::NotConnected);
        }
        let service = mcp::rpc_service(node.node_id());
        let (session, bridge) = session_pair();
        let state = Arc::new(ServerState {
            node: node.clone(),
            service: service.clone(),
            inbound: Mutex::new(Some(bridge.inbound)),
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        node.register_service(
            service.clone(),
            RpcService {
                state: state.clone(),
            },
        )
        .await?;

        tokio::spawn(pump_responses(state.clone(), bridge.outbound, node.closed()));
        info!(service = %service, "MCP server bridge ready");
        Ok((Self { state }, session))
    }

    pub fn service(&self) -> &str {
        &self.state.service
    }

    /// End the session and close the node's connection.
    pub async fn close(&self) {
        self.state.close_session();
        self.state.node.close().await;
    }
}

/// Route session responses back to the callers waiting on them.
async fn pump_responses(
    state: Arc<ServerState>,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    connection_closed: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(connection_closed);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = &mut connection_closed => {
                debug!("Bus connection ended, closing MCP session");
                break;
            }
            message = outbound.recv() => match message {
                Some(JsonRpcMessage::Response(response)) => {
                    let waiter = response.id.as_u64().and_then(|id| state.waiters().remove(&id));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(id = %response.id, "Session response for no pending request"),
                    }
                }
                Some(other) => {
                    // Server-initiated requests need a reverse channel the bus
                    // does not provide.
                    warn!("Dropping server-initiated message: {:?}", other);
                }
                None => break,
            },
        }
    }
    state.close_session();
}
