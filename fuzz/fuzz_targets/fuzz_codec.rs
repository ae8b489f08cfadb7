// Copyright 2026 BadCompany
// Licensed under the Apache License, Version 2.0

#![no_main]

use busnode::bus::codec::EnvelopeCodec;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Any byte sequence must frame without panicking. A small limit keeps
    // the oversized-record path hot.
    let mut codec = EnvelopeCodec::with_max_length(256);
    let mut buffer = BytesMut::from(data);

    while let Ok(Some(_)) = codec.decode(&mut buffer) {}
    let _ = codec.decode_eof(&mut buffer);
});
