//! cypher_crypto — Cypher Messenger cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`  — Ed25519 signing keys, X25519 agreement keys, master-signed
//!                 device bundles, `UserConfig`, the generic `Signed<T>` wrapper
//! - `x3dh`      — X3DH-like asynchronous key agreement between devices
//! - `ratchet`   — full double ratchet with DH steps + skipped message keys
//! - `aead`      — AES-256-GCM encrypt/decrypt helpers + key wrapping
//! - `kdf`       — HKDF / Argon2id key derivation
//! - `canonical` — canonical byte encoding for signatures
//! - `error`     — unified error type

pub mod aead;
pub mod canonical;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
