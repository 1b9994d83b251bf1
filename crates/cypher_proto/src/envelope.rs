//! Encrypted message envelope — what the server transport sees.
//!
//! The transport is a DUMB RELAY: it only sees addressing
//! (`from`/`to` device addresses), the `remote_id` used for ack/dedup, a
//! push-type hint, and the ratchet header + ciphertext. It CANNOT see the
//! message type, plaintext, or any metadata beyond the above. A handshake
//! header rides along on session-initiating envelopes only.

use std::fmt;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use cypher_crypto::{
    aead,
    identity::{DeviceId, Username},
    ratchet::RatchetHeader,
    x3dh::HandshakeHeader,
};

use crate::{
    codec::{decode, encode},
    error::CodecError,
};

/// Current wire version.
pub const WIRE_VERSION: u8 = 1;

// ── Addressing ───────────────────────────────────────────────────────────────

/// One device of one user — the unit of delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    #[serde(rename = "u")]
    pub user: Username,
    #[serde(rename = "d")]
    pub device: DeviceId,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.user, self.device)
    }
}

/// Hint for the transport's push machinery; opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PushType {
    /// No user-visible notification (magic traffic, acks).
    Silent,
    /// A user-visible message.
    Message,
}

impl From<PushType> for u8 {
    fn from(value: PushType) -> Self {
        match value {
            PushType::Silent => 0,
            PushType::Message => 1,
        }
    }
}

impl TryFrom<u8> for PushType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PushType::Silent),
            1 => Ok(PushType::Message),
            other => Err(format!("unknown push type {other}")),
        }
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// On-wire envelope — one ratchet-sealed message for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "f")]
    pub from: DeviceAddress,
    #[serde(rename = "t")]
    pub to: DeviceAddress,
    /// Dedup identity: redelivery of the same (sender, remote_id) to the
    /// same device is a no-op on the receiver.
    #[serde(rename = "r")]
    pub remote_id: String,
    #[serde(rename = "p")]
    pub push_type: PushType,
    #[serde(rename = "h")]
    pub header: RatchetHeader,
    #[serde(rename = "c")]
    pub ciphertext: Vec<u8>,
    /// Present on session-initiating envelopes only.
    #[serde(rename = "hs", skip_serializing_if = "Option::is_none", default)]
    pub handshake: Option<HandshakeHeader>,
}

impl Envelope {
    pub fn check_version(&self) -> Result<(), CodecError> {
        if self.version != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

// ── Encrypted<T> ─────────────────────────────────────────────────────────────

/// A sealed authenticated box over the canonical encoding of `T`.
/// Carries nonce + ciphertext + tag concatenated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encrypted<T> {
    data: Vec<u8>,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Encrypted<T> {
    pub fn seal(key: &[u8; 32], value: &T, aad: &[u8]) -> Result<Self, CodecError> {
        let plaintext = encode(value)?;
        let data = aead::encrypt(key, &plaintext, aad)?;
        Ok(Self {
            data,
            _marker: PhantomData,
        })
    }

    pub fn open(&self, key: &[u8; 32], aad: &[u8]) -> Result<T, CodecError> {
        let plaintext = aead::decrypt(key, &self.data, aad)?;
        decode(&plaintext)
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
