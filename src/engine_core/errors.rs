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

// Domain error types for the bus engine

use std::time::Duration;
use thiserror::Error;

/// Main error type for node operations
#[derive(Error, Debug)]
pub enum BusError {
    /// Daemon unreachable
    #[error("Failed to connect to daemon at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed daemon address
    #[error("Invalid daemon address: {0}")]
    InvalidAddress(String),

    /// Empty topic or service name
    #[error("Invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    /// Operation attempted before `connect`
    #[error("Node is not connected")]
    NotConnected,

    /// Connection dropped while the operation was outstanding
    #[error("Connection to daemon lost")]
    ConnectionLost,

    /// Correlated call not answered in time
    #[error("Call to '{service}' timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    /// The inbound sequence can only be consumed once per connection
    #[error("Inbound stream already taken")]
    ReceiverTaken,

    /// The remote service handler failed and answered with a fault
    #[error("Service '{service}' failed: {message}")]
    Remote { service: String, message: String },

    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization Error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-record decoding failures. These never terminate the inbound stream.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid UTF-8 in record: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Invalid record: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Unrecognized op '{0}'")]
    UnknownOp(String),

    #[error("Record exceeds {limit} bytes")]
    Oversized { limit: usize },
}

impl BusError {
    /// Get user-friendly error message.
    pub fn user_message(&self) -> String {
        match self {
            BusError::Connect { address, .. } => format!("Daemon unreachable at {}", address),
            BusError::InvalidAddress(addr) => format!("Invalid daemon address '{}'", addr),
            BusError::InvalidName { kind, .. } => format!("A {} name must not be empty", kind),
            BusError::NotConnected => "Not connected to the bus".to_string(),
            BusError::ConnectionLost => "Connection to the bus was lost".to_string(),
            BusError::Timeout { service, .. } => format!("No answer from '{}'", service),
            BusError::ReceiverTaken => "Internal error".to_string(),
            BusError::Remote { service, message } => {
                format!("Service '{}' failed: {}", service, message)
            }
            BusError::Io(_) => "Internal system error".to_string(),
            BusError::Serialization(_) => "Internal error".to_string(),
        }
    }

    /// Whether the error means the connection is gone and callers should
    /// reconnect or terminate.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BusError::Connect { .. } | BusError::ConnectionLost | BusError::NotConnected
        )
    }
}
