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

//! Subscription and service registries.
//!
//! Both map a name to handlers and remember in which connection epoch the
//! name was last announced to the daemon, so a registration goes on the wire
//! at most once per connection no matter how `register` and `connect` race.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::engine_core::models::InboundMessage;

/// Callback for messages published on a subscribed topic.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage) -> anyhow::Result<()>;

    /// Label used in logs when the handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Request/response endpoint. A synchronous handler is simply one whose
/// future completes on first poll.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Answer one call. An `Err` reaches the caller as `BusError::Remote`.
    ///
    /// The fault shape `{"bus_error": {"service": .., "message": ..}}` (a
    /// single `bus_error` key holding exactly those two strings) is reserved:
    /// a successful answer of that shape is also read as a fault by the
    /// caller. Any other use of the `bus_error` key passes through unchanged.
    async fn invoke(&self, payload: Value) -> anyhow::Result<Value>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

#[async_trait]
impl<F, Fut> TopicHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_message(&self, message: InboundMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

#[async_trait]
impl<F, Fut> ServiceHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
        (self)(payload).await
    }
}

struct Entry<H: ?Sized> {
    handlers: Vec<Arc<H>>,
    announced_epoch: Option<u64>,
}

struct Registry<H: ?Sized> {
    entries: RwLock<HashMap<String, Entry<H>>>,
}

impl<H: ?Sized> Registry<H> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the handlers that were displaced (only when `replace` is set).
    fn insert(&self, name: &str, handler: Arc<H>, replace: bool) -> Vec<Arc<H>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
            handlers: Vec::new(),
            announced_epoch: None,
        });
        let displaced = if replace {
            std::mem::take(&mut entry.handlers)
        } else {
            Vec::new()
        };
        entry.handlers.push(handler);
        displaced
    }

    fn handlers(&self, name: &str) -> Vec<Arc<H>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|e| e.handlers.clone())
            .unwrap_or_default()
    }

    fn claim_announcement(&self, name: &str, epoch: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(name) {
            Some(entry) if entry.announced_epoch != Some(epoch) => {
                entry.announced_epoch = Some(epoch);
                true
            }
            _ => false,
        }
    }

    fn claim_pending(&self, epoch: u64) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = entries
            .iter_mut()
            .filter(|(_, e)| e.announced_epoch != Some(epoch))
            .map(|(name, e)| {
                e.announced_epoch = Some(epoch);
                name.clone()
            })
            .collect();
        names.sort();
        names
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// topic -> handlers. A topic may have many handlers.
pub struct SubscriptionRegistry {
    inner: Registry<dyn TopicHandler>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Registry::new(),
        }
    }

    pub fn add(&self, topic: &str, handler: Arc<dyn TopicHandler>) {
        self.inner.insert(topic, handler, false);
    }

    pub fn handlers(&self, topic: &str) -> Vec<Arc<dyn TopicHandler>> {
        self.inner.handlers(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.names()
    }

    /// True if the caller must send the `subscribe` record for `epoch`.
    pub fn claim_announcement(&self, topic: &str, epoch: u64) -> bool {
        self.inner.claim_announcement(topic, epoch)
    }

    /// Topics not yet announced in `epoch`, now marked as announced.
    pub fn claim_pending(&self, epoch: u64) -> Vec<String> {
        self.inner.claim_pending(epoch)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// service name -> exactly one handler.
pub struct ServiceRegistry {
    inner: Registry<dyn ServiceHandler>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Registry::new(),
        }
    }

    /// Install `handler` for `service`, replacing any previous one. Returns
    /// true when a handler was replaced.
    pub fn set(&self, service: &str, handler: Arc<dyn ServiceHandler>) -> bool {
        let displaced = self.inner.insert(service, handler, true);
        for old in &displaced {
            warn!(
                service = %service,
                handler = old.name(),
                "Replacing existing service handler"
            );
        }
        !displaced.is_empty()
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.inner.handlers(service).pop()
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.names()
    }

    pub fn claim_announcement(&self, service: &str, epoch: u64) -> bool {
        self.inner.claim_announcement(service, epoch)
    }

    pub fn claim_pending(&self, epoch: u64) -> Vec<String> {
        self.inner.claim_pending(epoch)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
