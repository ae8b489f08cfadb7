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

//! Inbound dispatch loop.
//!
//! Pulls envelopes off the connection in wire order and routes them by `op`.
//! Handler invocations run as independent tasks so a slow handler never
//! blocks delivery of the next record.
//!
//! States: Idle -> Running -> Draining -> Stopped. Stopped is terminal.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::connection::{BusConnection, InboundStream};
use crate::bus::node::NodeShared;
use crate::engine_core::models::{Envelope, InboundMessage, ServiceFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Why the loop left Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// `DispatchHandle::shutdown` was called.
    Cancelled,
    /// The inbound stream ended or the node closed the connection.
    ConnectionClosed,
}

/// Control side of a [`DispatchLoop`]. Cheap to clone.
#[derive(Clone)]
pub struct DispatchHandle {
    cancel: CancellationToken,
    state: watch::Receiver<DispatchState>,
}

impl DispatchHandle {
    /// Request Draining. No effect once the loop has stopped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> DispatchState {
        *self.state.borrow()
    }

    /// Resolve once the loop reaches `target` (or immediately if it already
    /// has). Returns early if the loop was dropped without running.
    pub async fn wait_for(&self, target: DispatchState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == target).await;
    }
}

pub struct DispatchLoop {
    shared: Arc<NodeShared>,
    connection: Arc<BusConnection>,
    epoch: u64,
    inbound: InboundStream,
    connection_closed: CancellationToken,
    cancel: CancellationToken,
    state: watch::Sender<DispatchState>,
    tasks: JoinSet<()>,
    grace: Duration,
}

impl DispatchLoop {
    pub(crate) fn new(
        shared: Arc<NodeShared>,
        connection: Arc<BusConnection>,
        epoch: u64,
        inbound: InboundStream,
        connection_closed: CancellationToken,
    ) -> (Self, DispatchHandle) {
        let cancel = CancellationToken::new();
        let (state, state_rx) = watch::channel(DispatchState::Idle);
        let grace = shared.config.drain_grace;
        let handle = DispatchHandle {
            cancel: cancel.clone(),
            state: state_rx,
        };
        let dispatch = Self {
            shared,
            connection,
            epoch,
            inbound,
            connection_closed,
            cancel,
            state,
            tasks: JoinSet::new(),
            grace,
        };
        (dispatch, handle)
    }

    pub async fn run(mut self) -> DispatchExit {
        self.state.send_replace(DispatchState::Running);
        info!(node_id = %self.shared.node_id, peer = %self.connection.peer(), "Dispatch loop running");

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break DispatchExit::Cancelled,
                _ = self.connection_closed.cancelled() => break DispatchExit::ConnectionClosed,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    Self::reap(joined);
                }
                next = self.inbound.next() => match next {
                    Some(envelope) => self.route(envelope),
                    None => break DispatchExit::ConnectionClosed,
                },
            }
        };

        self.state.send_replace(DispatchState::Draining);
        info!(reason = ?exit, in_flight = self.tasks.len(), "Dispatch loop draining");
        self.drain().await;

        self.shared.disconnect(Some(self.epoch)).await;
        self.state.send_replace(DispatchState::Stopped);
        info!("Dispatch loop stopped");
        exit
    }

    fn route(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Message {
                topic,
                payload,
                sender,
            } => self.deliver_message(InboundMessage {
                topic,
                payload,
                sender,
            }),
            Envelope::CallService {
                service,
                request_id,
                payload,
                caller_id,
            } => self.serve_call(service, request_id, payload, caller_id),
            Envelope::ServiceResponse {
                request_id,
                payload,
                ..
            } => {
                self.shared.correlator.complete(&request_id, payload);
            }
            other => debug!(op = other.op(), "Ignoring outbound-only op received from daemon"),
        }
    }

    fn deliver_message(&mut self, message: InboundMessage) {
        let handlers = self.shared.subscriptions.handlers(&message.topic);
        if handlers.is_empty() {
            debug!(topic = %message.topic, "No handler for topic");
            return;
        }
        for handler in handlers {
            let message = message.clone();
            self.tasks.spawn(async move {
                let topic = message.topic.clone();
                match AssertUnwindSafe(handler.on_message(message))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(topic = %topic, handler = handler.name(), "Topic handler failed: {:#}", e)
                    }
                    Err(panic) => error!(
                        topic = %topic,
                        handler = handler.name(),
                        "Topic handler panicked: {}",
                        panic_message(panic.as_ref())
                    ),
                }
            });
        }
    }

    fn serve_call(&mut self, service: String, request_id: String, payload: serde_json::Value, caller_id: String) {
        let handler = self.shared.services.get(&service);
        let connection = self.connection.clone();
        self.tasks.spawn(async move {
            let response = match handler {
                Some(handler) => match AssertUnwindSafe(handler.invoke(payload)).catch_unwind().await {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => {
                        error!(
                            service = %service,
                            request_id = %request_id,
                            handler = handler.name(),
                            "Service handler failed: {:#}",
                            e
                        );
                        ServiceFault::new(&service, format!("{:#}", e)).into_payload()
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(
                            service = %service,
                            request_id = %request_id,
                            handler = handler.name(),
                            "Service handler panicked: {}",
                            message
                        );
                        ServiceFault::new(&service, format!("handler panicked: {}", message)).into_payload()
                    }
                },
                None => {
                    warn!(service = %service, caller_id = %caller_id, "Call for a service this node does not host");
                    ServiceFault::new(&service, "service not registered").into_payload()
                }
            };

            let reply = Envelope::ServiceResponse {
                service,
                request_id,
                payload: response,
                caller_id,
            };
            if let Err(e) = connection.send(&reply).await {
                warn!("Could not deliver service response: {}", e);
            }
        });
    }

    async fn drain(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                Self::reap(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(
                remaining = self.tasks.len(),
                grace = ?self.grace,
                "Grace period elapsed, aborting in-flight handlers"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }

    fn reap(joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Handler task panicked: {}", e);
            }
        }
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        // Aborted task, dropped `run()` future or a loop that never ran. The
        // inbound stream dies with the loop, so the connection goes too.
        if *self.state.borrow() == DispatchState::Stopped {
            return;
        }
        if self.shared.detach(Some(self.epoch)).is_some() {
            warn!(
                node_id = %self.shared.node_id,
                epoch = self.epoch,
                "Dispatch loop dropped while active, connection released"
            );
        }
        self.state.send_replace(DispatchState::Stopped);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
