// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Message body encoding.
//!
//! Structured values travel as UTF-8 JSON, anything else as its plain string form.
//! Decoding is best effort: a body that is not JSON comes back as a string.

use serde::Serialize;
use serde_json::Value;

/// Encodes a value for the wire.
///
/// Objects, arrays and `null` are written as JSON text, strings are written raw and
/// numbers/booleans use their display form.
pub fn encode(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Number(n) => n.to_string().into_bytes(),
        Value::Bool(b) => b.to_string().into_bytes(),
        // serializing a Value cannot fail
        _ => serde_json::to_vec(value).unwrap_or_default(),
    }
}

/// Encodes any serializable type with the same rules as [`encode`].
pub fn encode_serialize<T: Serialize + ?Sized>(data: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(data)?;
    Ok(encode(&value))
}

/// Decodes a body, never failing.
///
/// # Parameters
/// * `data` - The raw message body
///
/// # Returns
/// The parsed JSON value, or the lossy UTF-8 text as a string value
pub fn decode(data: &[u8]) -> Value {
    let raw = String::from_utf8_lossy(data);

    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.into_owned()),
    }
}
