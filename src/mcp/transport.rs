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

//! Session-side transport for MCP over the bus.
//!
//! A bridge hands its JSON-RPC session a [`SessionChannels`] pair: messages
//! the session should process arrive on `incoming`, messages it produces go
//! to `outgoing`. `incoming` ending is the session's end-of-stream.
//!
//! [`relay`] connects such a pair to a line-oriented byte stream (stdio for a
//! local MCP client process).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use crate::engine_core::constants::limits;
use crate::engine_core::models::JsonRpcMessage;

pub struct SessionChannels {
    pub incoming: mpsc::Receiver<JsonRpcMessage>,
    pub outgoing: mpsc::Sender<JsonRpcMessage>,
}

/// The bridge's ends of a session.
pub(crate) struct BridgeChannels {
    pub(crate) inbound: mpsc::Sender<JsonRpcMessage>,
    pub(crate) outbound: mpsc::Receiver<JsonRpcMessage>,
}

pub(crate) fn session_pair() -> (SessionChannels, BridgeChannels) {
    let (inbound, incoming) = mpsc::channel(limits::SESSION_CHANNEL_CAPACITY);
    let (outgoing, outbound) = mpsc::channel(limits::SESSION_CHANNEL_CAPACITY);
    (
        SessionChannels { incoming, outgoing },
        BridgeChannels { inbound, outbound },
    )
}

/// Pump newline-delimited JSON-RPC between a byte stream and a session.
///
/// Lines read from `reader` go to `outgoing`; messages from `incoming` are
/// written to `writer`. When the reader hits EOF, `outgoing` is dropped so the
/// session sees end-of-input, and answers still in flight keep being written
/// until `incoming` ends. Returns once `incoming` ends or the session stops
/// accepting input.
pub async fn relay<R, W>(reader: R, mut writer: W, channels: SessionChannels) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let SessionChannels {
        mut incoming,
        outgoing,
    } = channels;
    let mut outgoing = Some(outgoing);
    let mut lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(limits::MAX_RECORD_BYTES),
    );

    loop {
        tokio::select! {
            line = lines.next(), if outgoing.is_some() => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line).and_then(JsonRpcMessage::from_value) {
                        Ok(message) => {
                            let sent = match &outgoing {
                                Some(tx) => tx.send(message).await.is_ok(),
                                None => false,
                            };
                            if !sent {
                                debug!("Session closed, stopping relay");
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Dropping malformed JSON-RPC line: {}", e),
                    }
                }
                Some(Err(e)) => {
                    warn!("Relay input failed: {}", e);
                    outgoing = None;
                }
                None => {
                    debug!("Relay input reached EOF, waiting for pending answers");
                    outgoing = None;
                }
            },
            message = incoming.recv() => match message {
                Some(message) => {
                    let json = serde_json::to_string(&message.to_value()?)
                        .context("Failed to serialize JSON-RPC message")?;
                    writer.write_all(json.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
                None => {
                    debug!("Session stream ended");
                    return Ok(());
                }
            },
        }
    }
}
