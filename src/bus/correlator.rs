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

//! Outbound request correlation.
//!
//! Single source of truth for which `service_response` records are expected.
//! Every pending entry is removed on completion, timeout, abandonment (the
//! [`PendingCall`] is dropped) or connection loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::engine_core::errors::BusError;

type Slot = oneshot::Sender<Result<Value, BusError>>;
type PendingMap = Arc<Mutex<HashMap<String, Slot>>>;

fn lock(map: &PendingMap) -> MutexGuard<'_, HashMap<String, Slot>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct RequestCorrelator {
    pending: PendingMap,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id and its completion handle. The caller sends
    /// the matching `call_service` record.
    pub fn begin_call(&self) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(id.clone(), tx);
        PendingCall {
            id,
            rx,
            pending: self.pending.clone(),
        }
    }

    /// Resolve the call waiting on `request_id`. Returns false (and does
    /// nothing else) for ids that are not outstanding.
    pub fn complete(&self, request_id: &str, payload: Value) -> bool {
        let slot = lock(&self.pending).remove(request_id);
        match slot {
            Some(tx) => {
                if tx.send(Ok(payload)).is_err() {
                    debug!(request_id = %request_id, "Caller gave up before the response arrived");
                }
                true
            }
            None => {
                debug!(request_id = %request_id, "Discarding response for unknown request id");
                false
            }
        }
    }

    /// Fail every outstanding call. Returns how many were failed.
    pub fn fail_all(&self, error: impl Fn() -> BusError) -> usize {
        let drained: Vec<Slot> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error()));
        }
        if count > 0 {
            debug!(count, "Failed outstanding calls");
        }
        count
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// Completion handle for one outstanding call.
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<Result<Value, BusError>>,
    pending: PendingMap,
}

impl PendingCall {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response. With a `timeout`, the entry is removed and
    /// `BusError::Timeout` returned once it elapses.
    pub async fn wait(mut self, service: &str, timeout: Option<Duration>) -> Result<Value, BusError> {
        let received = match timeout {
            Some(after) => match tokio::time::timeout(after, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(request_id = %self.id, service = %service, "Call timed out");
                    return Err(BusError::Timeout {
                        service: service.to_string(),
                        after,
                    });
                }
            },
            None => (&mut self.rx).await,
        };
        // A dropped slot means the correlator itself went away.
        received.unwrap_or(Err(BusError::ConnectionLost))
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}
