//! Canonical JSON encoding used for every blob igor-ci writes into git.
//!
//! UTF-8, sorted keys, two-space indent, no trailing whitespace before a
//! newline (spec.md Section 3, invariant 3). Sorted keys fall out of going
//! through `serde_json::Value` before encoding: without the
//! `preserve_order` feature, `Value::Object` is backed by a `BTreeMap`, so
//! building a `Value` from any serializable struct re-sorts its fields —
//! serializing the struct directly with `to_vec_pretty` would not, since
//! struct field order is declaration order regardless of that feature.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonError {
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decoding error: {0}")]
    Decode(serde_json::Error),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Serialise `value` as canonical JSON bytes: sorted keys, two-space
/// indent, trailing newline.
pub fn to_canonical_bytes(value: &impl Serialize) -> Result<Vec<u8>, JsonError> {
    let value = serde_json::to_value(value)?;
    let mut bytes = serde_json::to_vec_pretty(&value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse canonical JSON bytes into a generic [`Value`].
pub fn from_bytes(bytes: &[u8]) -> Result<Value, JsonError> {
    let text = String::from_utf8(bytes.to_vec())?;
    serde_json::from_str(&text).map_err(JsonError::Decode)
}

/// Parse canonical JSON bytes into a typed value.
pub fn from_bytes_typed<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, JsonError> {
    let text = String::from_utf8(bytes.to_vec())?;
    serde_json::from_str(&text).map_err(JsonError::Decode)
}
