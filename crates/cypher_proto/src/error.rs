use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error(transparent)]
    Crypto(#[from] cypher_crypto::CryptoError),
}
