//! Identity keys and the device trust graph.
//!
//! Each *user* is anchored by one long-term master signing key (Ed25519).
//! Each *device* owns a signing key pair and an agreement key pair; its
//! `DeviceBundle` binds both public halves to a device id. Every bundle of a
//! user is signed by that user's master signing key and travels inside a
//! `UserConfig`.
//!
//! Trust model (NON-NEGOTIABLE)
//! ----------------------------
//! The master key is the only trust anchor. A peer pins the master key once;
//! every other device key is trusted transitively via its bundle signature.
//! A bundle MUST NOT be consumed before its signature has been verified
//! against the master key — `validate_and_list_devices` is the only gate.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::{canonical::canonical_bytes, error::CryptoError};

// ── Username ──────────────────────────────────────────────────────────────────

/// Case-insensitive user identifier. Stored and compared in canonical
/// (lowercased, trimmed) form; deserialization canonicalizes too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Username {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Username::new(&raw))
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── DeviceId ──────────────────────────────────────────────────────────────────

/// 128-bit opaque device identifier, created once per install.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", hex::encode(self.0))
    }
}

// ── Public keys ───────────────────────────────────────────────────────────────

/// 32-byte Ed25519 verifying key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicSigningKey(pub [u8; 32]);

impl PublicSigningKey {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Public key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Verify `sig_bytes` over `msg` under this key.
    pub fn verify(&self, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_slice(sig_bytes).map_err(|_| CryptoError::InvalidSignature)?;
        vk.verify(msg, &sig).map_err(|_| CryptoError::InvalidSignature)
    }

    /// Human-readable fingerprint: BLAKE3 of the key, truncated to 20 bytes
    /// (160 bits), hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Numeric fingerprint for QR comparison: 12 groups of 5 digits.
    pub fn numeric_fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let bytes = hash.as_bytes();
        let mut groups = Vec::with_capacity(12);
        for i in 0..12 {
            // 20 bits per group, mod 100000
            let offset = i * 5 / 2;
            let val = if i % 2 == 0 {
                ((bytes[offset] as u32) << 12)
                    | ((bytes[offset + 1] as u32) << 4)
                    | ((bytes[offset + 2] as u32) >> 4)
            } else {
                (((bytes[offset] & 0x0F) as u32) << 16)
                    | ((bytes[offset + 1] as u32) << 8)
                    | (bytes[offset + 2] as u32)
            };
            groups.push(format!("{:05}", val % 100_000));
        }
        groups.join(" ")
    }

    /// Constant-time fingerprint comparison for verification flows.
    pub fn fingerprints_match(&self, other: &PublicSigningKey) -> bool {
        let h1 = blake3::hash(&self.0);
        let h2 = blake3::hash(&other.0);
        let mut diff = 0u8;
        for (a, b) in h1.as_bytes().iter().zip(h2.as_bytes().iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

/// 32-byte X25519 public key (agreement half of a device key, rotated by
/// the ratchet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicAgreementKey(pub [u8; 32]);

impl PublicAgreementKey {
    pub fn as_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }

    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl From<x25519_dalek::PublicKey> for PublicAgreementKey {
    fn from(key: x25519_dalek::PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

// ── Key pairs ─────────────────────────────────────────────────────────────────

/// Ed25519 signing key pair. Private half never leaves the owning device;
/// Drop clears memory.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public: PublicSigningKey,
    secret: [u8; 32],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicSigningKey(signing_key.verifying_key().to_bytes()),
            secret: signing_key.to_bytes(),
        }
    }

    pub fn public(&self) -> PublicSigningKey {
        self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes().to_vec()
    }
}

/// X25519 agreement key pair. The static half doubles as the signed prekey
/// for session bootstrap; the ratchet rotates its own ephemeral successors.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
pub struct AgreementKeyPair {
    #[zeroize(skip)]
    public: PublicAgreementKey,
    secret: [u8; 32],
}

impl AgreementKeyPair {
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        Self {
            public: PublicAgreementKey(*x25519_dalek::PublicKey::from(&secret).as_bytes()),
            secret: secret.to_bytes(),
        }
    }

    pub fn public(&self) -> PublicAgreementKey {
        self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn diffie_hellman(&self, peer: &PublicAgreementKey) -> [u8; 32] {
        let secret = x25519_dalek::StaticSecret::from(self.secret);
        *secret.diffie_hellman(&peer.as_x25519()).as_bytes()
    }
}

// ── Signed wrapper ────────────────────────────────────────────────────────────

/// A payload together with the key that signed it and the signature over the
/// payload's canonical bytes. Readers MUST verify before consuming —
/// `open()` is the intended accessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signed<T> {
    #[serde(rename = "p")]
    pub payload: T,
    #[serde(rename = "k")]
    pub signer_pub: PublicSigningKey,
    #[serde(rename = "s")]
    pub signature: Vec<u8>,
}

impl<T: Serialize> Signed<T> {
    pub fn sign(payload: T, key: &SigningKeyPair) -> Result<Self, CryptoError> {
        let bytes = canonical_bytes(&payload)?;
        let signature = key.sign(&bytes);
        Ok(Self {
            payload,
            signer_pub: key.public(),
            signature,
        })
    }

    /// Verify the signature against the embedded signer key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let bytes = canonical_bytes(&self.payload)?;
        self.signer_pub.verify(&bytes, &self.signature)
    }

    /// Verify against an *expected* signer (the caller's trust anchor) and
    /// return the payload. An embedded key that differs from the expected
    /// one fails as `InvalidSignature` — an attacker swapping both key and
    /// signature must not pass.
    pub fn open(&self, expected_signer: &PublicSigningKey) -> Result<&T, CryptoError> {
        if &self.signer_pub != expected_signer {
            return Err(CryptoError::InvalidSignature);
        }
        self.verify()?;
        Ok(&self.payload)
    }
}

// ── Device bundle & user config ───────────────────────────────────────────────

/// Public half of one device's identity, bound to its device id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBundle {
    #[serde(rename = "d")]
    pub device_id: DeviceId,
    #[serde(rename = "s")]
    pub signing_pub: PublicSigningKey,
    #[serde(rename = "a")]
    pub agreement_pub: PublicAgreementKey,
    #[serde(rename = "m")]
    pub is_master: bool,
}

/// A user's published device list: the master signing key plus one signed
/// bundle per device. Invariants (enforced by `validate_and_list_devices`):
/// every bundle verifies under the master key, device ids are unique, and
/// exactly one bundle is the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(rename = "mk")]
    pub master_signing_pub: PublicSigningKey,
    #[serde(rename = "ds")]
    pub devices: Vec<Signed<DeviceBundle>>,
}

impl UserConfig {
    /// Verify every bundle and return them in deterministic
    /// (device-id-sorted) order.
    pub fn validate_and_list_devices(&self) -> Result<Vec<DeviceBundle>, CryptoError> {
        let mut bundles = Vec::with_capacity(self.devices.len());
        let mut masters = 0usize;
        for signed in &self.devices {
            let bundle = signed.open(&self.master_signing_pub)?;
            if bundle.is_master {
                masters += 1;
            }
            bundles.push(bundle.clone());
        }
        if masters != 1 {
            return Err(CryptoError::MasterBundleCount);
        }
        bundles.sort_by_key(|b| b.device_id);
        for pair in bundles.windows(2) {
            if pair[0].device_id == pair[1].device_id {
                return Err(CryptoError::DuplicateDevice(pair[0].device_id.to_string()));
            }
        }
        Ok(bundles)
    }

    /// Validated lookup of a single device bundle.
    pub fn device(&self, id: DeviceId) -> Result<Option<DeviceBundle>, CryptoError> {
        Ok(self
            .validate_and_list_devices()?
            .into_iter()
            .find(|b| b.device_id == id))
    }

    /// Add a master-signed bundle. Idempotent by device id: re-adding an
    /// already-listed device is a no-op (returns false). A second master
    /// bundle is rejected.
    pub fn add_device_bundle(
        &mut self,
        signed: Signed<DeviceBundle>,
    ) -> Result<bool, CryptoError> {
        let bundle = signed.open(&self.master_signing_pub)?;
        if bundle.is_master {
            return Err(CryptoError::MasterBundleCount);
        }
        let device_id = bundle.device_id;
        if self
            .validate_and_list_devices()?
            .iter()
            .any(|b| b.device_id == device_id)
        {
            return Ok(false);
        }
        self.devices.push(signed);
        Ok(true)
    }

    /// Remove a non-master bundle. Requires the master key: the surviving
    /// list is re-signed wholesale, so stale copies of the old list cannot
    /// be replayed as current.
    pub fn remove_device_bundle(
        &mut self,
        master: &SigningKeyPair,
        id: DeviceId,
    ) -> Result<(), CryptoError> {
        if master.public() != self.master_signing_pub {
            return Err(CryptoError::InvalidSignature);
        }
        let bundles = self.validate_and_list_devices()?;
        let target = bundles.iter().find(|b| b.device_id == id);
        match target {
            None => Ok(()),
            Some(b) if b.is_master => Err(CryptoError::MasterBundleImmutable),
            Some(_) => {
                let mut fresh = Vec::with_capacity(bundles.len() - 1);
                for bundle in bundles.into_iter().filter(|b| b.device_id != id) {
                    fresh.push(Signed::sign(bundle, master)?);
                }
                self.devices = fresh;
                Ok(())
            }
        }
    }
}

// ── Device identity ───────────────────────────────────────────────────────────

/// The full key material of one enrolled device. Secrets exist only here;
/// persisted solely through the encrypted store.
#[derive(Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub username: Username,
    pub device_id: DeviceId,
    pub signing: SigningKeyPair,
    pub agreement: AgreementKeyPair,
    pub is_master: bool,
}

impl DeviceIdentity {
    pub fn bundle(&self) -> DeviceBundle {
        DeviceBundle {
            device_id: self.device_id,
            signing_pub: self.signing.public(),
            agreement_pub: self.agreement.public(),
            is_master: self.is_master,
        }
    }
}

/// Generate fresh key material for a new device install.
pub fn generate_device_identity(username: Username, is_master: bool) -> DeviceIdentity {
    DeviceIdentity {
        username,
        device_id: DeviceId::generate(),
        signing: SigningKeyPair::generate(),
        agreement: AgreementKeyPair::generate(),
        is_master,
    }
}

/// Build a user's published config from the master device plus any
/// already-enrolled sibling bundles.
pub fn build_user_config(
    master: &DeviceIdentity,
    other_bundles: &[DeviceBundle],
) -> Result<UserConfig, CryptoError> {
    let mut devices = vec![Signed::sign(master.bundle(), &master.signing)?];
    for bundle in other_bundles {
        devices.push(Signed::sign(bundle.clone(), &master.signing)?);
    }
    let config = UserConfig {
        master_signing_pub: master.signing.public(),
        devices,
    };
    config.validate_and_list_devices()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_identity() -> DeviceIdentity {
        generate_device_identity(Username::new("Alice"), true)
    }

    #[test]
    fn username_is_case_insensitive() {
        assert_eq!(Username::new("Alice"), Username::new("  aLiCe "));
        assert_eq!(Username::new("m0").as_str(), "m0");
    }

    #[test]
    fn config_lists_devices_sorted_by_id() {
        let master = master_identity();
        let d1 = generate_device_identity(master.username.clone(), false);
        let d2 = generate_device_identity(master.username.clone(), false);
        let config = build_user_config(&master, &[d1.bundle(), d2.bundle()]).unwrap();

        let listed = config.validate_and_list_devices().unwrap();
        assert_eq!(listed.len(), 3);
        let mut ids: Vec<_> = listed.iter().map(|b| b.device_id).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        assert_eq!(ids, sorted);
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn tampered_bundle_fails_validation() {
        let master = master_identity();
        let other = generate_device_identity(master.username.clone(), false);
        let mut config = build_user_config(&master, &[other.bundle()]).unwrap();

        // Flip the agreement key after signing
        config.devices[1].payload.agreement_pub = AgreementKeyPair::generate().public();

        let err = config.validate_and_list_devices();
        assert!(matches!(err, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn bundle_signed_by_foreign_key_is_rejected() {
        let master = master_identity();
        let mallory = generate_device_identity(Username::new("mallory"), true);
        let mut config = build_user_config(&master, &[]).unwrap();

        let rogue = generate_device_identity(master.username.clone(), false);
        let signed = Signed::sign(rogue.bundle(), &mallory.signing).unwrap();
        let err = config.add_device_bundle(signed);
        assert!(matches!(err, Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn add_device_bundle_is_idempotent() {
        let master = master_identity();
        let other = generate_device_identity(master.username.clone(), false);
        let mut config = build_user_config(&master, &[]).unwrap();

        let signed = Signed::sign(other.bundle(), &master.signing).unwrap();
        assert!(config.add_device_bundle(signed.clone()).unwrap());
        assert!(!config.add_device_bundle(signed).unwrap());
        assert_eq!(config.devices.len(), 2);
    }

    #[test]
    fn master_bundle_cannot_be_removed() {
        let master = master_identity();
        let mut config = build_user_config(&master, &[]).unwrap();
        let err = config.remove_device_bundle(&master.signing, master.device_id);
        assert!(matches!(err, Err(CryptoError::MasterBundleImmutable)));
    }

    #[test]
    fn removal_resigns_the_surviving_list() {
        let master = master_identity();
        let other = generate_device_identity(master.username.clone(), false);
        let mut config = build_user_config(&master, &[other.bundle()]).unwrap();

        config
            .remove_device_bundle(&master.signing, other.device_id)
            .unwrap();
        let listed = config.validate_and_list_devices().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_master);
    }

    #[test]
    fn fingerprints_are_stable_and_comparable() {
        let key = SigningKeyPair::generate().public();
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_eq!(key.numeric_fingerprint().split(' ').count(), 12);
        assert!(key.fingerprints_match(&key));
        assert!(!key.fingerprints_match(&SigningKeyPair::generate().public()));
    }
}
