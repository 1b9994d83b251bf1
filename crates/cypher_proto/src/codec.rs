//! Wire codec — deterministic serialization, framing, and padding.
//!
//! # Encoding
//! All wire structs serialize to MessagePack in named-field mode: struct
//! fields are written as map entries in declaration order and free-form
//! documents are `BTreeMap`s, so `encode` is byte-stable for a given value.
//! Fixed-schema structs pin short field keys (`#[serde(rename = "…")]`) so
//! the keys survive struct renames across versions. Missing required fields
//! fail decoding; optional fields from newer peers ride in each container's
//! reserved extension map (`z`) and survive re-serialization opaquely.
//!
//! # Padding
//! To resist traffic analysis, plaintext is padded to fixed size buckets
//! before sealing, so the transport sees uniform-sized ciphertext.
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536
//! Messages larger than the top bucket are not padded.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CodecError;

/// Encode a value to its canonical wire bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode canonical wire bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

// ── Padding ──────────────────────────────────────────────────────────────────

/// Padding mode for metadata minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// No padding — minimal bandwidth.
    None,
    /// Pad to fixed-size buckets.
    Buckets,
    /// Pad all messages to the maximum bucket size (64KB).
    /// Maximum privacy, maximum bandwidth.
    Maximum,
}

impl Default for PaddingMode {
    fn default() -> Self {
        Self::Buckets
    }
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];

/// Pad plaintext to the next bucket boundary.
///
/// Format: [original_len: u32 LE] [plaintext] [random padding]
///
/// The length prefix allows unambiguous unpadding after decryption.
pub fn pad_to_bucket(plaintext: &[u8], mode: PaddingMode) -> Vec<u8> {
    match mode {
        PaddingMode::None => {
            let mut out = Vec::with_capacity(4 + plaintext.len());
            out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
            out.extend_from_slice(plaintext);
            out
        }
        PaddingMode::Buckets => {
            let needed = 4 + plaintext.len();
            let bucket = BUCKET_SIZES
                .iter()
                .copied()
                .find(|&b| b >= needed)
                .unwrap_or(needed); // larger than max bucket: no padding
            pad_to_size(plaintext, bucket)
        }
        PaddingMode::Maximum => pad_to_size(plaintext, *BUCKET_SIZES.last().unwrap()),
    }
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, CodecError> {
    if padded.len() < 4 {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

fn pad_to_size(plaintext: &[u8], target: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    // Fill remaining with random bytes (not zeros — avoids compression leaks)
    let remaining = target.saturating_sub(out.len());
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(rename = "a")]
        tag: String,
        #[serde(rename = "b")]
        count: u64,
        #[serde(rename = "z", default, skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, serde_json::Value>,
    }

    #[test]
    fn encode_is_byte_stable() {
        let value = Sample {
            tag: "x".into(),
            count: 7,
            extra: BTreeMap::new(),
        };
        assert_eq!(encode(&value).unwrap(), encode(&value).unwrap());
    }

    #[test]
    fn unknown_optional_fields_survive_reserialization() {
        let mut extra = BTreeMap::new();
        extra.insert("zz".to_string(), serde_json::json!("future"));
        let value = Sample {
            tag: "x".into(),
            count: 7,
            extra,
        };
        let bytes = encode(&value).unwrap();
        let decoded: Sample = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        #[derive(Serialize)]
        struct Partial {
            #[serde(rename = "a")]
            tag: String,
        }
        let bytes = encode(&Partial { tag: "x".into() }).unwrap();
        assert!(decode::<Sample>(&bytes).is_err());
    }

    #[test]
    fn pad_unpad_roundtrip_buckets() {
        let msg = b"Hello, World!";
        let padded = pad_to_bucket(msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 256); // smallest bucket
        let unpadded = unpad(&padded).unwrap();
        assert_eq!(unpadded, msg);
    }

    #[test]
    fn pad_unpad_roundtrip_none() {
        let msg = b"No padding test";
        let padded = pad_to_bucket(msg, PaddingMode::None);
        assert_eq!(padded.len(), 4 + msg.len());
        let unpadded = unpad(&padded).unwrap();
        assert_eq!(unpadded, msg);
    }

    #[test]
    fn pad_unpad_large_message() {
        let msg = vec![0x42u8; 5000];
        let padded = pad_to_bucket(&msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 16384); // next bucket up from 5004
        let unpadded = unpad(&padded).unwrap();
        assert_eq!(unpadded, msg);
    }

    #[test]
    fn unpad_rejects_lying_length_prefix() {
        let mut padded = pad_to_bucket(b"short", PaddingMode::None);
        padded[0] = 0xFF;
        padded[1] = 0xFF;
        assert!(matches!(unpad(&padded), Err(CodecError::InvalidPadding(_))));
    }
}
