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

//! MCP over the bus.
//!
//! Transport adapters that carry a JSON-RPC session between two nodes as
//! service calls, plus the prebuilt publish bridge.

pub mod client;
pub mod publish_bridge;
pub mod server;
pub mod transport;

pub use client::McpClientBridge;
pub use publish_bridge::{McpPublishBridge, PublishBridgeService};
pub use server::McpServerBridge;
pub use transport::{relay, SessionChannels};
