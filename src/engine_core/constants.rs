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

//! busnode Constants - Single source of truth for all configuration values.
//!
//! This module centralizes wire limits, error codes, environment variable
//! names and naming conventions shared by the bus engine and the MCP bridges.

/// JSON-RPC 2.0 Error Codes
pub mod jsonrpc {
    /// Bus transport failure surfaced to an MCP session (custom code)
    pub const ERROR_TRANSPORT: i32 = -32000;
    /// Method not found (standard JSON-RPC)
    pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid request (standard JSON-RPC)
    pub const ERROR_INVALID_REQUEST: i32 = -32600;
    /// Internal error (standard JSON-RPC)
    pub const ERROR_INTERNAL: i32 = -32603;
    /// Protocol version marker
    pub const VERSION: &str = "2.0";
}

/// Configuration Environment Variables
pub mod config {
    pub const ENV_DAEMON_URL: &str = "TAGENTACLE_DAEMON_URL";
    pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
    pub const ENV_CALL_TIMEOUT_MS: &str = "BUS_CALL_TIMEOUT_MS";
    pub const ENV_DRAIN_GRACE_MS: &str = "BUS_DRAIN_GRACE_MS";

    pub const DEFAULT_DAEMON_URL: &str = "tcp://127.0.0.1:19999";
    pub const DEFAULT_DRAIN_GRACE_MS: u64 = 2_000;
}

/// Wire operation tags (`op` field of every envelope)
pub mod ops {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const PUBLISH: &str = "publish";
    pub const ADVERTISE_SERVICE: &str = "advertise_service";
    pub const CALL_SERVICE: &str = "call_service";
    pub const MESSAGE: &str = "message";
    pub const SERVICE_RESPONSE: &str = "service_response";

    pub const ALL: [&str; 6] = [
        SUBSCRIBE,
        PUBLISH,
        ADVERTISE_SERVICE,
        CALL_SERVICE,
        MESSAGE,
        SERVICE_RESPONSE,
    ];
}

/// MCP Protocol Methods
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const NOTIFICATIONS_INITIALIZED: &str = "notifications/initialized";
}

/// MCP-over-bus naming conventions
pub mod mcp {
    /// Topic receiving a read-only copy of every request/response pair served
    /// by a server bridge.
    pub const MCP_TRAFFIC_TOPIC: &str = "/mcp/traffic";
    /// Protocol version announced by the prebuilt publish bridge.
    pub const PROTOCOL_VERSION: &str = "2024-11-05";
    pub const PUBLISH_BRIDGE_NAME: &str = "bus-publish-bridge";
    pub const DEFAULT_PUBLISH_BRIDGE_NODE_ID: &str = "mcp_publish_bridge";

    /// Service name under which a node serves MCP JSON-RPC.
    pub fn rpc_service(node_id: &str) -> String {
        format!("/mcp/{}/rpc", node_id)
    }
}

/// Transport Limits (DoS Protection)
pub mod limits {
    /// Maximum allowed wire record size (10 MB)
    pub const MAX_RECORD_BYTES: usize = 10 * 1024 * 1024;
    /// Capacity of the channels feeding an MCP session
    pub const SESSION_CHANNEL_CAPACITY: usize = 32;
}
