//! Canonical byte encoding for signed payloads.
//!
//! Signatures cover MessagePack named-field bytes: struct fields serialize
//! in declaration order and free-form documents are `BTreeMap`s, so the
//! encoding of a value is byte-stable across processes and re-serialization.

use serde::Serialize;

use crate::error::CryptoError;

/// Encode `value` to its canonical signing bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    rmp_serde::to_vec_named(value).map_err(|e| CryptoError::Encode(e.to_string()))
}
