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

//! Bus protocol engine: framing, connection, registries, correlation and
//! inbound dispatch for one node.

pub mod codec;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod node;
pub mod registry;

pub use connection::BusConnection;
pub use dispatch::{DispatchExit, DispatchHandle, DispatchLoop, DispatchState};
pub use node::Node;
pub use registry::{ServiceHandler, TopicHandler};
