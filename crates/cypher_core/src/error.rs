//! Unified error type for the messenger core.
//!
//! Variant names are stable identifiers; embedders may match on them.
//! Per-device failures stay local to their device path — the router keeps
//! going for the remaining devices and surfaces the casualty on the event
//! bus instead of failing the whole send.

use thiserror::Error;

use cypher_crypto::CryptoError;
use cypher_proto::{CodecError, DeviceAddress};

#[derive(Debug, Error)]
pub enum MessengerError {
    // ── Cryptographic / protocol ─────────────────────────────────────────
    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceAddress),

    #[error("Message authentication failed")]
    InvalidMac,

    #[error("Skipped-key cache exhausted; session needs a rekey")]
    RatchetOverflow,

    #[error("Message outside the session's reorder window")]
    OutOfOrder,

    #[error("Duplicate message {0}")]
    DuplicateMessage(String),

    // ── I/O ──────────────────────────────────────────────────────────────
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Partially sent ({} delivered, {} failed)", delivered.len(), failed.len())]
    PartiallySent {
        delivered: Vec<DeviceAddress>,
        failed: Vec<DeviceAddress>,
    },

    // ── Persistence ──────────────────────────────────────────────────────
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Corrupted persistent state: {0}")]
    Corrupted(String),

    // ── Group rules ──────────────────────────────────────────────────────
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Sender was kicked from the group")]
    Kicked,

    #[error("Not a member of the group")]
    NotAMember,

    // ── Programmer error ─────────────────────────────────────────────────
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl From<CryptoError> for MessengerError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidSignature => Self::InvalidSignature,
            CryptoError::InvalidMac => Self::InvalidMac,
            CryptoError::RatchetOverflow { .. } => Self::RatchetOverflow,
            other => Self::InternalInvariant(other.to_string()),
        }
    }
}

impl From<CodecError> for MessengerError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Crypto(inner) => inner.into(),
            other => Self::Corrupted(other.to_string()),
        }
    }
}
