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

//! Bus Wire Codec.
//!
//! Frames envelopes as newline-delimited JSON records. Decoding yields one
//! `Result<Envelope, DecodeError>` per line so a malformed record never tears
//! down the framed stream; only I/O failures do.

use crate::engine_core::constants::limits;
use crate::engine_core::errors::{BusError, DecodeError};
use crate::engine_core::models::Envelope;
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub struct EnvelopeCodec {
    max_length: usize,
    // Bytes already scanned for a newline
    next_index: usize,
    // Skipping the tail of an oversized record
    discarding: bool,
}

impl EnvelopeCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(limits::MAX_RECORD_BYTES)
    }

    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn parse_line(line: &[u8]) -> Result<Envelope, DecodeError> {
        let text = std::str::from_utf8(line)?;
        let value: Value = serde_json::from_str(text)?;
        let envelope = Envelope::from_value(value)?;
        trace!("Decoded {} record", envelope.op());
        Ok(envelope)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

// Drops the terminator, a trailing `\r` and surrounding blanks.
fn trim_line(line: &[u8]) -> &[u8] {
    line.trim_ascii()
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, DecodeError>;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, BusError> {
        loop {
            let read_to = src.len().min(self.max_length.saturating_add(1));
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Err(DecodeError::Oversized {
                        limit: self.max_length,
                    })));
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset + 1;
                    self.next_index = 0;
                    let raw = src.split_to(end);
                    let line = trim_line(&raw);
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(Self::parse_line(line)));
                }
                (false, None) if src.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, BusError> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.discarding {
            src.clear();
            self.discarding = false;
            self.next_index = 0;
            return Ok(Some(Err(DecodeError::Oversized {
                limit: self.max_length,
            })));
        }
        self.next_index = 0;
        let raw = src.split();
        let line = trim_line(&raw);
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::parse_line(line)))
    }
}

impl<'a> Encoder<&'a Envelope> for EnvelopeCodec {
    type Error = BusError;

    fn encode(&mut self, item: &'a Envelope, dst: &mut BytesMut) -> Result<(), BusError> {
        let body = serde_json::to_vec(item)?;
        dst.reserve(body.len() + 1);
        dst.put_slice(&body);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish() -> Envelope {
        Envelope::Publish {
            topic: "/alerts/critical".to_string(),
            sender: "n1".to_string(),
            payload: json!({"msg": "hello"}),
        }
    }

    #[test]
    fn test_encode_is_one_line() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&publish(), &mut buf).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }

    #[test]
    fn test_decode_waits_for_full_line() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"op":"subscribe","topic":"/a","#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#""node_id":"n"}"#);
        buf.extend_from_slice(b"\r\n");
        let env = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(
            env,
            Envelope::Subscribe {
                topic: "/a".to_string(),
                node_id: "n".to_string()
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_record_does_not_poison_stream() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"this is not json\n\n");
        buf.extend_from_slice(b"{\"op\":\"heartbeat\"}\n");
        codec.encode(&publish(), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(DecodeError::InvalidJson(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Err(DecodeError::UnknownOp(op)) if op == "heartbeat"));

        let third = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(third, publish());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_reported() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"op\": \"\xFF\xFF\"}\n"[..]);
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Err(DecodeError::InvalidUtf8(_))));
    }

    #[test]
    fn test_oversized_record_is_discarded() {
        let mut codec = EnvelopeCodec::with_max_length(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 40]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[b'y'; 40]);
        buf.extend_from_slice(b"\n");
        buf.extend_from_slice(br#"{"op":"subscribe","topic":"/t","node_id":"n"}"#);

        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Err(DecodeError::Oversized { limit: 32 })));

        // The next record is larger than 32 bytes too; it must also be skipped.
        buf.extend_from_slice(b"\n");
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Err(DecodeError::Oversized { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_flushes_unterminated_line() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&br#"{"op":"advertise_service","service":"/s","node_id":"n"}"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let env = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(env.op(), "advertise_service");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
