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

//! Node aggregate.
//!
//! A [`Node`] owns everything one bus participant needs: its registries, the
//! request correlator and the current connection. Clones share state, so a
//! handler can capture a clone and publish or call services from inside a
//! callback.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::connection::BusConnection;
use crate::bus::correlator::RequestCorrelator;
use crate::bus::dispatch::{DispatchExit, DispatchHandle, DispatchLoop};
use crate::bus::registry::{ServiceHandler, ServiceRegistry, SubscriptionRegistry, TopicHandler};
use crate::config::Config;
use crate::engine_core::errors::BusError;
use crate::engine_core::models::{Envelope, ServiceFault};

/// The connection currently in use and the epoch it was attached in.
#[derive(Clone)]
struct Live {
    connection: Arc<BusConnection>,
    epoch: u64,
    closed: CancellationToken,
}

pub(crate) struct NodeShared {
    pub(crate) node_id: String,
    pub(crate) config: Config,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) services: ServiceRegistry,
    pub(crate) correlator: RequestCorrelator,
    live: RwLock<Option<Live>>,
    epochs: AtomicU64,
}

impl NodeShared {
    fn current(&self) -> Option<Live> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live(&self) -> Result<Live, BusError> {
        self.current().ok_or(BusError::NotConnected)
    }

    /// Forget the current connection, wake `closed()` waiters and fail every
    /// pending call. With `Some(epoch)` only that epoch's connection is
    /// affected, so a stale dispatch loop never detaches a newer connection.
    /// Returns the detached connection for the caller to close.
    pub(crate) fn detach(&self, epoch: Option<u64>) -> Option<Arc<BusConnection>> {
        let live = {
            let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
            match (live.as_ref(), epoch) {
                (Some(current), Some(e)) if current.epoch != e => None,
                _ => live.take(),
            }
        }?;
        live.closed.cancel();
        let failed = self.correlator.fail_all(|| BusError::ConnectionLost);
        info!(
            node_id = %self.node_id,
            epoch = live.epoch,
            failed_calls = failed,
            "Disconnected from bus"
        );
        Some(live.connection)
    }

    /// Detach and close the connection of `epoch` (or whichever is current).
    pub(crate) async fn disconnect(&self, epoch: Option<u64>) {
        if let Some(connection) = self.detach(epoch) {
            connection.close().await;
        }
    }
}

/// Topic and service names are non-empty.
fn validate_name(kind: &'static str, name: &str) -> Result<(), BusError> {
    if name.trim().is_empty() {
        return Err(BusError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Handle to one bus participant.
#[derive(Clone)]
pub struct Node {
    shared: Arc<NodeShared>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, config: Config) -> Self {
        Self {
            shared: Arc::new(NodeShared {
                node_id: node_id.into(),
                config,
                subscriptions: SubscriptionRegistry::new(),
                services: ServiceRegistry::new(),
                correlator: RequestCorrelator::new(),
                live: RwLock::new(None),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Node configured from the environment (daemon address and timeouts).
    pub fn from_env(node_id: impl Into<String>) -> Result<Self, BusError> {
        Ok(Self::new(node_id, Config::from_env()?))
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Connect to the configured daemon and flush deferred registrations.
    pub async fn connect(&self) -> Result<(), BusError> {
        let address = self.shared.config.daemon_address()?;
        let connection = BusConnection::connect(&address).await?;
        self.attach(connection).await
    }

    /// Adopt an established connection, replacing any previous one, and
    /// announce every registration not yet sent on it.
    pub async fn attach(&self, connection: BusConnection) -> Result<(), BusError> {
        self.shared.disconnect(None).await;

        let epoch = self.shared.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let live = Live {
            connection: Arc::new(connection),
            epoch,
            closed: CancellationToken::new(),
        };
        *self.shared.live.write().unwrap_or_else(PoisonError::into_inner) = Some(live.clone());
        info!(node_id = %self.shared.node_id, peer = %live.connection.peer(), epoch, "Connected to bus");

        for topic in self.shared.subscriptions.claim_pending(epoch) {
            self.announce_subscription(&live, topic).await?;
        }
        for service in self.shared.services.claim_pending(epoch) {
            self.announce_service(&live, service).await?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current().is_some()
    }

    /// Register a topic handler. Announced immediately when connected,
    /// otherwise on the next connect.
    pub async fn subscribe<H>(&self, topic: impl Into<String>, handler: H) -> Result<(), BusError>
    where
        H: TopicHandler + 'static,
    {
        let topic = topic.into();
        validate_name("topic", &topic)?;
        self.shared.subscriptions.add(&topic, Arc::new(handler));
        match self.shared.current() {
            Some(live) if self.shared.subscriptions.claim_announcement(&topic, live.epoch) => {
                self.announce_subscription(&live, topic).await
            }
            Some(_) => Ok(()),
            None => {
                debug!(topic = %topic, "Subscription deferred until connect");
                Ok(())
            }
        }
    }

    /// Register the handler for `service`, replacing any existing one.
    pub async fn register_service<H>(&self, service: impl Into<String>, handler: H) -> Result<(), BusError>
    where
        H: ServiceHandler + 'static,
    {
        let service = service.into();
        validate_name("service", &service)?;
        self.shared.services.set(&service, Arc::new(handler));
        match self.shared.current() {
            Some(live) if self.shared.services.claim_announcement(&service, live.epoch) => {
                self.announce_service(&live, service).await
            }
            Some(_) => Ok(()),
            None => {
                debug!(service = %service, "Service advertisement deferred until connect");
                Ok(())
            }
        }
    }

    pub async fn publish(&self, topic: impl Into<String>, payload: Value) -> Result<(), BusError> {
        let topic = topic.into();
        validate_name("topic", &topic)?;
        let live = self.shared.live()?;
        live.connection
            .send(&Envelope::Publish {
                topic,
                sender: self.shared.node_id.clone(),
                payload,
            })
            .await
    }

    /// Call a service and wait for its response. `timeout` falls back to the
    /// configured default; with neither, the call waits until the response
    /// arrives or the connection is lost. A fault answer from the serving
    /// node is returned as `BusError::Remote`.
    pub async fn call_service(
        &self,
        service: impl Into<String>,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BusError> {
        let service = service.into();
        validate_name("service", &service)?;
        let live = self.shared.live()?;
        let pending = self.shared.correlator.begin_call();
        debug!(service = %service, request_id = %pending.id(), "Calling service");

        live.connection
            .send(&Envelope::CallService {
                service: service.clone(),
                request_id: pending.id().to_string(),
                payload,
                caller_id: self.shared.node_id.clone(),
            })
            .await?;

        let response = pending
            .wait(&service, timeout.or(self.shared.config.call_timeout))
            .await?;
        match ServiceFault::from_payload(&response) {
            Some(fault) => Err(BusError::Remote {
                service: fault.service,
                message: fault.message,
            }),
            None => Ok(response),
        }
    }

    /// Fire-and-forget call. The request id is not tracked, so any response
    /// is discarded on arrival.
    pub async fn notify_service(&self, service: impl Into<String>, payload: Value) -> Result<(), BusError> {
        let service = service.into();
        validate_name("service", &service)?;
        let live = self.shared.live()?;
        live.connection
            .send(&Envelope::CallService {
                service,
                request_id: Uuid::new_v4().to_string(),
                payload,
                caller_id: self.shared.node_id.clone(),
            })
            .await
    }

    /// Build the dispatch loop for the current connection, in Idle. The loop
    /// owns the connection's inbound stream: dropping it, run or not, detaches
    /// the connection and fails pending calls.
    pub fn dispatcher(&self) -> Result<(DispatchLoop, DispatchHandle), BusError> {
        let live = self.shared.live()?;
        let inbound = live.connection.receive()?;
        Ok(DispatchLoop::new(
            self.shared.clone(),
            live.connection,
            live.epoch,
            inbound,
            live.closed,
        ))
    }

    /// Run the dispatch loop until the connection ends or the node is closed.
    /// Dropping the future before it completes also ends the connection.
    pub async fn spin(&self) -> Result<DispatchExit, BusError> {
        let (dispatch, _handle) = self.dispatcher()?;
        Ok(dispatch.run().await)
    }

    /// Resolves when the current connection ends (immediately when not
    /// connected). The future does not borrow the node.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.shared.current().map(|live| live.closed);
        async move {
            if let Some(token) = token {
                token.cancelled().await;
            }
        }
    }

    /// Close the connection and fail pending calls. Idempotent.
    pub async fn close(&self) {
        self.shared.disconnect(None).await;
    }

    async fn announce_subscription(&self, live: &Live, topic: String) -> Result<(), BusError> {
        debug!(topic = %topic, epoch = live.epoch, "Announcing subscription");
        let result = live
            .connection
            .send(&Envelope::Subscribe {
                topic,
                node_id: self.shared.node_id.clone(),
            })
            .await;
        if let Err(e) = &result {
            warn!("Failed to announce subscription: {}", e);
        }
        result
    }

    async fn announce_service(&self, live: &Live, service: String) -> Result<(), BusError> {
        debug!(service = %service, epoch = live.epoch, "Advertising service");
        let result = live
            .connection
            .send(&Envelope::AdvertiseService {
                service,
                node_id: self.shared.node_id.clone(),
            })
            .await;
        if let Err(e) = &result {
            warn!("Failed to advertise service: {}", e);
        }
        result
    }
}
