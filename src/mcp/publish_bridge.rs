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

//! Publish bridge.
//!
//! A ready-made MCP server, reachable over the bus, whose tools publish to
//! bus topics. An optional list of topic prefixes restricts where agents may
//! publish.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bus::node::Node;
use crate::bus::registry::ServiceHandler;
use crate::engine_core::constants::{jsonrpc, mcp, methods};
use crate::engine_core::errors::BusError;
use crate::engine_core::models::{CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolDefinition};

pub const TOOL_PUBLISH: &str = "publish_to_topic";
pub const TOOL_LIST_TOPICS: &str = "list_available_topics";

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: TOOL_PUBLISH.to_string(),
            description: "Publish a JSON message to a bus Topic. \
                          Other nodes subscribed to that topic will receive the message."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "topic": {
                        "type": "string",
                        "description": "The topic path to publish to (e.g., '/alerts/critical')"
                    },
                    "payload": {
                        "type": "object",
                        "description": "The JSON payload to publish"
                    }
                },
                "required": ["topic", "payload"]
            }),
        },
        ToolDefinition {
            name: TOOL_LIST_TOPICS.to_string(),
            description: "List the topics that this bridge is allowed to publish to. \
                          Returns 'all' if there are no restrictions."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
}

pub struct PublishBridgeService {
    node: Node,
    allowed_topics: Option<Vec<String>>,
}

impl PublishBridgeService {
    /// `allowed_topics = None` means every topic is allowed.
    pub fn new(node: Node, allowed_topics: Option<Vec<String>>) -> Self {
        Self { node, allowed_topics }
    }

    pub fn is_allowed(&self, topic: &str) -> bool {
        match &self.allowed_topics {
            None => true,
            Some(prefixes) => prefixes.iter().any(|p| topic.starts_with(p.as_str())),
        }
    }

    /// Handle one JSON-RPC message. Notifications yield `None`.
    pub async fn handle_jsonrpc(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            if request.method == methods::NOTIFICATIONS_INITIALIZED {
                debug!("Client initialized");
            } else {
                debug!(method = %request.method, "Ignoring notification");
            }
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        let response = match request.method.as_str() {
            methods::INITIALIZE => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": mcp::PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {"listChanged": false}
                    },
                    "serverInfo": {
                        "name": mcp::PUBLISH_BRIDGE_NAME,
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            ),
            methods::TOOLS_LIST => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
            methods::TOOLS_CALL => {
                let params = request.params.clone().unwrap_or_else(|| json!({}));
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                self.call_tool(id, name, &arguments).await
            }
            other => JsonRpcResponse::error(
                id,
                jsonrpc::ERROR_METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        };
        Some(response)
    }

    async fn call_tool(&self, id: Value, name: &str, arguments: &Value) -> JsonRpcResponse {
        let result = match name {
            TOOL_PUBLISH => self.publish_to_topic(arguments).await,
            TOOL_LIST_TOPICS => self.list_available_topics(),
            _ => {
                return JsonRpcResponse::error(
                    id,
                    jsonrpc::ERROR_METHOD_NOT_FOUND,
                    format!("Unknown tool: {}", name),
                )
            }
        };
        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, jsonrpc::ERROR_INTERNAL, e.to_string()),
        }
    }

    async fn publish_to_topic(&self, arguments: &Value) -> CallToolResult {
        let topic = arguments.get("topic").and_then(Value::as_str).unwrap_or_default();
        if topic.is_empty() {
            return CallToolResult::error("Error: 'topic' must be a non-empty string.");
        }
        if !self.is_allowed(topic) {
            warn!(topic = %topic, "Publish denied by topic allow-list");
            return CallToolResult::error(format!("Error: Topic '{}' is not in the allow-list.", topic));
        }

        let payload = arguments.get("payload").cloned().unwrap_or_else(|| json!({}));
        match self.node.publish(topic, payload).await {
            Ok(()) => {
                info!(topic = %topic, "Published on behalf of MCP client");
                CallToolResult::text(format!("Published to '{}' successfully.", topic))
            }
            Err(e) => {
                warn!(topic = %topic, "Bridge publish failed: {}", e);
                CallToolResult::error(format!("Error: {}", e.user_message()))
            }
        }
    }

    fn list_available_topics(&self) -> CallToolResult {
        match &self.allowed_topics {
            None => CallToolResult::text("All topics are allowed (no restrictions)."),
            Some(prefixes) => CallToolResult::text(format!("Allowed topic prefixes: {:?}", prefixes)),
        }
    }
}

#[async_trait]
impl ServiceHandler for PublishBridgeService {
    async fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
        let id = payload.get("id").cloned().unwrap_or(Value::Null);
        if payload.get("method").and_then(Value::as_str).is_none() {
            let response = JsonRpcResponse::error(id, jsonrpc::ERROR_INVALID_REQUEST, "Invalid Request");
            return Ok(serde_json::to_value(response)?);
        }
        let request: JsonRpcRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                let response =
                    JsonRpcResponse::error(id, jsonrpc::ERROR_INVALID_REQUEST, format!("Invalid Request: {}", e));
                return Ok(serde_json::to_value(response)?);
            }
        };
        match self.handle_jsonrpc(&request).await {
            Some(response) => Ok(serde_json::to_value(response)?),
            None => Ok(Value::Null),
        }
    }

    fn name(&self) -> &str {
        "publish-bridge"
    }
}

/// The publish bridge registered on a node.
pub struct McpPublishBridge {
    node: Node,
    service: String,
}

impl McpPublishBridge {
    /// Register the bridge under `/mcp/<node-id>/rpc`. Works before or after
    /// the node connects.
    pub async fn start(node: &Node, allowed_topics: Option<Vec<String>>) -> Result<Self, BusError> {
        let service = mcp::rpc_service(node.node_id());
        if let Some(prefixes) = &allowed_topics {
            info!("Topic allow-list: {:?}", prefixes);
        }
        node.register_service(
            service.clone(),
            PublishBridgeService::new(node.clone(), allowed_topics),
        )
        .await?;
        let tools: Vec<String> = tool_definitions().into_iter().map(|t| t.name).collect();
        info!(service = %service, "Publish bridge ready, tools: {:?}", tools);
        Ok(Self {
            node: node.clone(),
            service,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn bridge(allowed: Option<Vec<&str>>) -> PublishBridgeService {
        PublishBridgeService::new(
            Node::new("bridge", Config::default()),
            allowed.map(|a| a.into_iter().map(String::from).collect()),
        )
    }

    async fn call(service: &PublishBridgeService, payload: Value) -> Value {
        service.invoke(payload).await.unwrap()
    }

    #[tokio::test]
    async fn test_tools_list_returns_exactly_two_tools() {
        let service = bridge(None);
        let resp = call(&service, json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})).await;
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "publish_to_topic");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["topic", "payload"]));
        assert_eq!(tools[0]["inputSchema"]["properties"]["payload"]["type"], "object");
        assert_eq!(tools[1]["name"], "list_available_topics");
        assert_eq!(tools[1]["inputSchema"], json!({"type": "object", "properties": {}}));
    }

    #[tokio::test]
    async fn test_initialize_metadata() {
        let service = bridge(None);
        let resp = call(&service, json!({"jsonrpc": "2.0", "id": "init", "method": "initialize"})).await;
        assert_eq!(resp["id"], "init");
        assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(resp["result"]["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(resp["result"]["serverInfo"]["name"], "bus-publish-bridge");
    }

    #[tokio::test]
    async fn test_denied_topic_is_tool_error_not_protocol_error() {
        let service = bridge(Some(vec!["/alerts"]));
        let resp = call(
            &service,
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "publish_to_topic", "arguments": {"topic": "/metrics", "payload": {}}}
            }),
        )
        .await;
        assert!(resp.get("error").is_none());
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(
            resp["result"]["content"][0]["text"],
            "Error: Topic '/metrics' is not in the allow-list."
        );
    }

    #[tokio::test]
    async fn test_allowed_topic_reaches_publish() {
        // The allow-list admits the topic; the unconnected node then fails the
        // publish itself, which is also reported as a tool error.
        let service = bridge(Some(vec!["/alerts"]));
        assert!(service.is_allowed("/alerts/critical"));
        assert!(!service.is_allowed("/metrics"));

        let resp = call(
            &service,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "publish_to_topic", "arguments": {"topic": "/alerts/critical", "payload": {"m": 1}}}
            }),
        )
        .await;
        assert_eq!(resp["result"]["isError"], true);
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(!text.contains("allow-list"));
    }

    #[tokio::test]
    async fn test_list_available_topics() {
        let open = bridge(None);
        let resp = call(
            &open,
            json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"name": "list_available_topics"}}),
        )
        .await;
        assert_eq!(
            resp["result"]["content"][0]["text"],
            "All topics are allowed (no restrictions)."
        );

        let restricted = bridge(Some(vec!["/alerts", "/logs"]));
        let resp = call(
            &restricted,
            json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call", "params": {"name": "list_available_topics", "arguments": {}}}),
        )
        .await;
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("/alerts") && text.contains("/logs"));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let service = bridge(None);

        let resp = call(&service, json!({"jsonrpc": "2.0", "id": 6, "method": "resources/list"})).await;
        assert_eq!(resp["error"]["code"], -32601);

        let resp = call(
            &service,
            json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {"name": "rm_rf"}}),
        )
        .await;
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["error"]["message"], "Unknown tool: rm_rf");

        let resp = call(&service, json!({"jsonrpc": "2.0", "id": 8})).await;
        assert_eq!(resp["error"]["code"], -32600);

        let resp = call(
            &service,
            json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call", "params": {"name": "publish_to_topic", "arguments": {}}}),
        )
        .await;
        assert_eq!(resp["result"]["isError"], true);
    }

    #[tokio::test]
    async fn test_initialized_notification_has_no_response() {
        let service = bridge(None);
        let resp = call(&service, json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        assert_eq!(resp, Value::Null);
    }
}
