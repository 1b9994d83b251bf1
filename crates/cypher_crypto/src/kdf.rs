//! Key derivation functions
//!
//! `master_key_from_password` — Argon2id, derives the 32-byte wrapping key
//!   that seals the at-rest master key.
//!
//! `hkdf_expand` — HKDF-SHA256, used for session key material.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Password wrapping key (Argon2id) ─────────────────────────────────────────

/// 32-byte key derived from the app password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct PasswordKey(pub [u8; 32]);

/// Argon2id parameters — tuned for interactive use.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .expect("Static Argon2 params are always valid")
}

/// Derive a wrapping key from the app password + 16-byte salt.
/// The salt is stored alongside the wrapped master key (not secret).
pub fn master_key_from_password(
    password: &[u8],
    salt: &[u8; 16],
) -> Result<PasswordKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(PasswordKey(output))
}

/// Generate a fresh random 16-byte salt (call once per enrollment; persist it).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be empty (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
