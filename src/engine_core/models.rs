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

//! Domain models for the bus node.
//!
//! This module contains the wire envelope exchanged with the daemon and the
//! JSON-RPC/MCP shapes carried inside envelope payloads. It is free of I/O.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine_core::constants::{jsonrpc, ops};
use crate::engine_core::errors::DecodeError;

/// One wire record. The `op` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Envelope {
    Subscribe {
        topic: String,
        node_id: String,
    },
    Publish {
        topic: String,
        sender: String,
        #[serde(default)]
        payload: Value,
    },
    AdvertiseService {
        service: String,
        node_id: String,
    },
    CallService {
        service: String,
        request_id: String,
        #[serde(default)]
        payload: Value,
        caller_id: String,
    },
    Message {
        topic: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    ServiceResponse {
        service: String,
        request_id: String,
        #[serde(default)]
        payload: Value,
        caller_id: String,
    },
}

impl Envelope {
    /// Decode a parsed JSON record, distinguishing unknown ops from malformed
    /// records of a known op.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let op = match value.get("op").and_then(Value::as_str) {
            Some(op) => op,
            None => return Err(DecodeError::UnknownOp("<missing>".to_string())),
        };
        if !ops::ALL.contains(&op) {
            return Err(DecodeError::UnknownOp(op.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn op(&self) -> &'static str {
        match self {
            Envelope::Subscribe { .. } => ops::SUBSCRIBE,
            Envelope::Publish { .. } => ops::PUBLISH,
            Envelope::AdvertiseService { .. } => ops::ADVERTISE_SERVICE,
            Envelope::CallService { .. } => ops::CALL_SERVICE,
            Envelope::Message { .. } => ops::MESSAGE,
            Envelope::ServiceResponse { .. } => ops::SERVICE_RESPONSE,
        }
    }
}

/// A topic message as seen by subscription handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Value,
    pub sender: Option<String>,
}

/// Error indicator sent as the payload of a `service_response` when the
/// serving handler failed, so the caller is never left waiting.
///
/// Only `{"bus_error": {"service": "..", "message": ".."}}` with no other
/// keys at either level is a fault; handlers must not answer with that shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFault {
    pub service: String,
    pub message: String,
}

impl ServiceFault {
    const KEY: &'static str = "bus_error";

    pub fn new(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn into_payload(self) -> Value {
        let mut outer = serde_json::Map::new();
        outer.insert(
            Self::KEY.to_string(),
            json!({ "service": self.service, "message": self.message }),
        );
        Value::Object(outer)
    }

    /// Recognize a fault payload. Only an object whose single key is the
    /// fault marker qualifies.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let obj = payload.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        serde_json::from_value(obj.get(Self::KEY)?.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: jsonrpc::VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any JSON-RPC message travelling through an MCP session.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.get("method").is_some() {
            let request: JsonRpcRequest = serde_json::from_value(value)?;
            if request.is_notification() {
                Ok(JsonRpcMessage::Notification(request))
            } else {
                Ok(JsonRpcMessage::Request(request))
            }
        } else {
            Ok(JsonRpcMessage::Response(serde_json::from_value(value)?))
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            JsonRpcMessage::Request(r) | JsonRpcMessage::Notification(r) => serde_json::to_value(r),
            JsonRpcMessage::Response(r) => serde_json::to_value(r),
        }
    }
}

/// Tool configuration (schema and metadata)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// Result of `tools/call`. Tool-level failures are reported here with
/// `is_error` set, not as JSON-RPC errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: true,
        }
    }
}
