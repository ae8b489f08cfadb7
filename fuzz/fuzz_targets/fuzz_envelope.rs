// Copyright 2026 BadCompany
// Licensed under the Apache License, Version 2.0

#![no_main]

use busnode::engine_core::models::{Envelope, JsonRpcMessage, ServiceFault};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    // Wire records and the JSON-RPC payloads they carry are both attacker
    // controlled.
    let _ = Envelope::from_value(value.clone());
    let _ = ServiceFault::from_payload(&value);
    if let Ok(message) = JsonRpcMessage::from_value(value) {
        let _ = message.to_value();
    }
});
