//! X3DH-like asynchronous key agreement between two devices.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   The initiator holds the responder's validated `DeviceBundle`:
//!     IK_B  (device signing key, Ed25519 public → converted to X25519)
//!     SPK_B (the bundle's static agreement key, X25519)
//!     OPK_B (optional one-time prekey, X25519)
//!
//!   The initiator generates ONE ephemeral keypair EK_A (X25519).
//!
//!   DH calculations (using a single EK_A throughout):
//!     DH1 = DH(IK_A_x25519, SPK_B)        — mutual authentication
//!     DH2 = DH(EK_A,        IK_B_x25519)  — forward secrecy
//!     DH3 = DH(EK_A,        SPK_B)        — replay protection
//!     DH4 = DH(EK_A,        OPK_B)        — one-time forward secrecy [optional]
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4],
//!             info="cypher-x3dh-v1")
//!
//! Non-negotiable:
//!   - The bundle MUST come out of `UserConfig::validate_and_list_devices`
//!     (the master signature over the bundle is what authenticates SPK_B).
//!   - The initiator sends (IK_A_pub, EK_A_pub, opk_id?) as the handshake
//!     header on the first envelope.
//!   - The responder reconstructs the same DH set and derives SK.
//!   - SK feeds into the double ratchet as the initial root key.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{AgreementKeyPair, DeviceBundle, DeviceIdentity, PublicAgreementKey, PublicSigningKey},
    kdf,
};

const X3DH_INFO: &[u8] = b"cypher-x3dh-v1";

/// Convert an Ed25519 signing secret (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion that ed25519-dalek applies internally,
/// mirroring libsignal's IK → X25519 conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key to an X25519 public key via the
/// birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &PublicSigningKey) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(&ed_pub.0)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Generate a batch of one-time prekeys (X25519), consumed once per
/// session init when the peer advertises them.
pub fn generate_one_time_prekeys(count: usize) -> Vec<AgreementKeyPair> {
    (0..count).map(|_| AgreementKeyPair::generate()).collect()
}

// ── Handshake header ─────────────────────────────────────────────────────────

/// Sent alongside the first ciphertext so the responder can derive SK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's Ed25519 device signing key — the responder cross-checks
    /// it against the initiator's validated device bundle.
    #[serde(rename = "i")]
    pub ik_pub: PublicSigningKey,
    /// Initiator's ephemeral X25519 public key.
    #[serde(rename = "e")]
    pub ek_pub: PublicAgreementKey,
    /// Which one-time prekey was consumed (`None` if the bundle had none).
    #[serde(rename = "o", skip_serializing_if = "Option::is_none", default)]
    pub opk_id: Option<String>,
}

/// Result of the initiator side: the shared secret plus the header the
/// responder needs.
pub struct X3dhResult {
    /// 32-byte shared key → initial double-ratchet root key.
    pub shared_key: [u8; 32],
    pub header: HandshakeHeader,
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Initiate a session toward `peer_bundle` (which MUST be master-validated).
pub fn initiate(
    my: &DeviceIdentity,
    peer_bundle: &DeviceBundle,
    one_time_prekey: Option<(&str, PublicAgreementKey)>,
) -> Result<X3dhResult, CryptoError> {
    let ik_a = ed25519_secret_to_x25519(my.signing.secret_bytes());
    let ik_b = ed25519_pub_to_x25519(&peer_bundle.signing_pub)?;
    let spk_b = peer_bundle.agreement_pub.as_x25519();

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = ik_a.diffie_hellman(&spk_b); // IK_A × SPK_B
    let dh2 = ek_a.diffie_hellman(&ik_b); // EK_A × IK_B
    let dh3 = ek_a.diffie_hellman(&spk_b); // EK_A × SPK_B

    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id_out = None;
    if let Some((opk_id, opk_pub)) = one_time_prekey {
        let dh4 = ek_a.diffie_hellman(&opk_pub.as_x25519()); // EK_A × OPK_B
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id_out = Some(opk_id.to_string());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(X3dhResult {
        shared_key: sk,
        header: HandshakeHeader {
            ik_pub: my.signing.public(),
            ek_pub: PublicAgreementKey::from(ek_a_pub),
            opk_id: opk_id_out,
        },
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct SK from a received handshake header.
///
/// `initiator_signing_pub` — the initiator's device signing key taken from
/// their *validated* bundle (never from the header alone). A header whose
/// embedded key disagrees is rejected outright.
pub fn respond(
    my: &DeviceIdentity,
    initiator_signing_pub: &PublicSigningKey,
    header: &HandshakeHeader,
    one_time_prekey: Option<&AgreementKeyPair>,
) -> Result<[u8; 32], CryptoError> {
    if &header.ik_pub != initiator_signing_pub {
        return Err(CryptoError::InvalidSignature);
    }

    let ik_a = ed25519_pub_to_x25519(initiator_signing_pub)?;
    let ik_b = ed25519_secret_to_x25519(my.signing.secret_bytes());
    let spk_b = StaticSecret::from(*my.agreement.secret_bytes());
    let ek_a = header.ek_pub.as_x25519();

    // Mirror the initiator's DH order exactly (DH is commutative):
    //   DH1 = IK_A × SPK_B, DH2 = EK_A × IK_B, DH3 = EK_A × SPK_B
    let dh1 = spk_b.diffie_hellman(&ik_a);
    let dh2 = ik_b.diffie_hellman(&ek_a);
    let dh3 = spk_b.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = one_time_prekey {
        let opk_secret = StaticSecret::from(*opk.secret_bytes());
        let dh4 = opk_secret.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}
