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

//! Duplex connection to the bus daemon.
//!
//! Owns the write half behind an async mutex so concurrent senders never
//! interleave partial records, and hands out the read half exactly once as a
//! stream of decoded envelopes.

use std::sync::Mutex;

use futures::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::bus::codec::EnvelopeCodec;
use crate::config::DaemonAddress;
use crate::engine_core::errors::{BusError, DecodeError};
use crate::engine_core::models::Envelope;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Decoded inbound envelopes in wire order. Ends at EOF or on a read error.
pub type InboundStream = BoxStream<'static, Envelope>;

pub struct BusConnection {
    peer: String,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxedWriter, EnvelopeCodec>>>,
    reader: Mutex<Option<FramedRead<BoxedReader, EnvelopeCodec>>>,
}

impl BusConnection {
    /// Open a TCP connection to the daemon.
    pub async fn connect(address: &DaemonAddress) -> Result<Self, BusError> {
        info!("Connecting to bus daemon at {}...", address);
        let stream = TcpStream::connect(address.socket_addr())
            .await
            .map_err(|source| BusError::Connect {
                address: address.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_io(
            address.to_string(),
            Box::new(read_half),
            Box::new(write_half),
        ))
    }

    /// Wrap an already established byte stream pair.
    pub fn from_io(peer: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(writer, EnvelopeCodec::new()))),
            reader: Mutex::new(Some(FramedRead::new(reader, EnvelopeCodec::new()))),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Encode and write one record, flushing before returning.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), BusError> {
        let mut guard = self.writer.lock().await;
        let framed = guard.as_mut().ok_or(BusError::ConnectionLost)?;
        trace!("Sending {} record", envelope.op());
        if let Err(e) = framed.send(envelope).await {
            warn!("Write to daemon failed: {}", e);
            // A failed write leaves the stream in an unknown state.
            guard.take();
            return Err(match e {
                BusError::Io(_) => BusError::ConnectionLost,
                other => other,
            });
        }
        Ok(())
    }

    /// Take the inbound record sequence. Can be called once per connection.
    pub fn receive(&self) -> Result<InboundStream, BusError> {
        let framed = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(BusError::ReceiverTaken)?;
        let peer = self.peer.clone();

        Ok(stream::unfold(framed, move |mut framed| {
            let peer = peer.clone();
            async move {
                loop {
                    match framed.next().await {
                        Some(Ok(Ok(envelope))) => return Some((envelope, framed)),
                        Some(Ok(Err(DecodeError::UnknownOp(op)))) => {
                            debug!("Ignoring record with unrecognized op '{}'", op);
                        }
                        Some(Ok(Err(e))) => {
                            warn!("Skipping malformed record from {}: {}", peer, e);
                        }
                        Some(Err(e)) => {
                            warn!("Read from {} failed: {}", peer, e);
                            return None;
                        }
                        None => {
                            debug!("Daemon {} closed the stream", peer);
                            return None;
                        }
                    }
                }
            }
        })
        .boxed())
    }

    /// Flush and release the write half. Safe to call repeatedly and from
    /// failure paths.
    pub async fn close(&self) {
        let writer = self.writer.lock().await.take();
        // Also drop an unclaimed read half so the socket is fully released.
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut framed) = writer {
            if let Err(e) = SinkExt::<&Envelope>::close(&mut framed).await {
                debug!("Error while closing connection to {}: {}", self.peer, e);
            }
            info!("Connection to {} closed", self.peer);
        }
    }

    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }
}
