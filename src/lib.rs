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

//! busnode: a bus client node with MCP-over-bus transport.
//!
//! The library lets a process join a publish/subscribe and request/response
//! message bus through a single daemon connection, and carries MCP JSON-RPC
//! sessions between nodes over that bus.

pub mod bus;
pub mod config;
pub mod engine_core;
pub mod mcp;
pub mod utils;

pub use bus::{Node, ServiceHandler, TopicHandler};
pub use config::Config;
pub use engine_core::errors::BusError;
