use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    InvalidMac,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("Skipped-key cache exhausted ({needed} keys needed, {cap} allowed)")]
    RatchetOverflow { needed: u32, cap: u32 },

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Duplicate device id in bundle list: {0}")]
    DuplicateDevice(String),

    #[error("Device bundle list must contain exactly one master bundle")]
    MasterBundleCount,

    #[error("The master bundle cannot be removed")]
    MasterBundleImmutable,

    #[error("Canonical encoding failed: {0}")]
    Encode(String),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
