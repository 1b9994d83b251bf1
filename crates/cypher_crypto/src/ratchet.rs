//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! DH Ratchet:
//!   Each party generates a new X25519 ratchet keypair per "turn" (when it
//!   receives a message carrying a new ratchet public key). The DH output is
//!   mixed into the root key via HKDF, producing a new root key and a new
//!   chain key. The step resets the send counter to 0 and snapshots the
//!   previous send counter into `prev_send_n`.
//!
//! Forward secrecy: old chain keys and message keys are deleted.
//! Post-compromise security: a new DH ratchet step restores secrecy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{AgreementKeyPair, PublicAgreementKey},
};

/// Default bound on cached skipped message keys per session.
/// Limits memory usage and prevents DoS via huge counter jumps.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Consecutive decrypt failures after which a rekey should be suggested.
pub const REKEY_FAILURE_THRESHOLD: u8 = 2;

// ── Ratchet header (sent with every ciphertext, unencrypted) ─────────────────

/// Lets the recipient advance its ratchet: the sender's current agreement
/// public key plus the send counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    #[serde(rename = "k")]
    pub agreement_pub: PublicAgreementKey,
    /// Number of messages in the previous sending chain.
    #[serde(rename = "pn")]
    pub pn: u32,
    /// Message number in the current sending chain.
    #[serde(rename = "n")]
    pub n: u32,
}

/// Which side of the handshake created this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetRole {
    Initiator,
    Responder,
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete double-ratchet session state for one (local device, peer device)
/// pair. Persisted only through the encrypted store. Clones exist so callers
/// can step a working copy and commit it only after the AEAD verifies.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    pub role: RatchetRole,

    root_key: [u8; 32],

    /// Our current DH ratchet secret. Regenerated on each DH step.
    dh_send_secret: [u8; 32],
    dh_send_pub: PublicAgreementKey,
    send_ck: [u8; 32],
    /// Send counter N (resets to 0 on a DH ratchet step).
    pub send_n: u32,

    /// Peer's last seen DH ratchet public key.
    dh_recv_pub: Option<PublicAgreementKey>,
    recv_ck: [u8; 32],
    /// Receive counter Nr within the current chain.
    pub recv_n: u32,
    /// Previous send chain length PN (snapshotted at each DH step).
    pub prev_send_n: u32,

    /// (chain key id, message number) → message key, for out-of-order
    /// receipt. Bounded by `max_skip`; keys are deleted on use.
    skipped: HashMap<(PublicAgreementKey, u32), [u8; 32]>,
    max_skip: u32,

    pub last_used: DateTime<Utc>,
    failed_decrypts: u8,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl RatchetSession {
    /// Create a session as the INITIATOR.
    ///
    /// The initiator has the X3DH shared key and the peer's static agreement
    /// key (which acts as the first "received" ratchet key); it performs a DH
    /// ratchet immediately so its first message already rides a fresh chain.
    pub fn init_initiator(
        shared_key: [u8; 32],
        peer_agreement_pub: &PublicAgreementKey,
        max_skip: u32,
    ) -> Result<Self, CryptoError> {
        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = PublicAgreementKey::from(X25519Public::from(&dh_send_secret));

        let dh_output = dh_send_secret.diffie_hellman(&peer_agreement_pub.as_x25519());
        let (root_key, send_ck) = kdf_rk(&shared_key, dh_output.as_bytes())?;

        Ok(Self {
            role: RatchetRole::Initiator,
            root_key,
            dh_send_secret: dh_send_secret.to_bytes(),
            dh_send_pub,
            send_ck,
            send_n: 0,
            dh_recv_pub: Some(*peer_agreement_pub),
            recv_ck: [0u8; 32], // established by the peer's first reply
            recv_n: 0,
            prev_send_n: 0,
            skipped: HashMap::new(),
            max_skip,
            last_used: Utc::now(),
            failed_decrypts: 0,
        })
    }

    /// Create a session as the RESPONDER.
    ///
    /// The responder's static agreement key is the initial ratchet key; its
    /// first DH ratchet happens when the initiator's first message arrives.
    pub fn init_responder(
        shared_key: [u8; 32],
        my_agreement: &AgreementKeyPair,
        max_skip: u32,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            role: RatchetRole::Responder,
            root_key: shared_key,
            dh_send_secret: *my_agreement.secret_bytes(),
            dh_send_pub: my_agreement.public(),
            send_ck: [0u8; 32], // set on the first DH ratchet
            send_n: 0,
            dh_recv_pub: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            prev_send_n: 0,
            skipped: HashMap::new(),
            max_skip,
            last_used: Utc::now(),
            failed_decrypts: 0,
        })
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Advance the send chain by one message. Returns the header to transmit
    /// and the one-time message key for AEAD sealing.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        let (next_ck, mk) = kdf_ck(&self.send_ck)?;
        self.send_ck = next_ck;
        let header = RatchetHeader {
            agreement_pub: self.dh_send_pub,
            pn: self.prev_send_n,
            n: self.send_n,
        };
        self.send_n += 1;
        self.last_used = Utc::now();
        Ok((header, mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for a received header.
    ///
    /// Handles three cases:
    ///   1. Message from the current receiving chain (normal)
    ///   2. Skipped message in the current or a previous chain
    ///   3. New DH ratchet (peer's agreement key changed)
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        // Case 2: cached skipped key
        if let Some(mk) = self.skipped.remove(&(header.agreement_pub, header.n)) {
            self.last_used = Utc::now();
            return Ok(mk);
        }

        // Case 3: DH ratchet needed?
        let need_dh_ratchet = match self.dh_recv_pub {
            Some(ref current) => current != &header.agreement_pub,
            None => true, // responder receiving the initiator's first message
        };

        if need_dh_ratchet {
            // Cache any remaining keys of the outgoing receiving chain
            if self.dh_recv_pub.is_some() {
                self.skip_message_keys(header.pn)?;
            }

            self.dh_recv_pub = Some(header.agreement_pub);

            // Receiving half of the DH step
            let dh_recv = StaticSecret::from(self.dh_send_secret)
                .diffie_hellman(&header.agreement_pub.as_x25519());
            let (new_rk, new_recv_ck) = kdf_rk(&self.root_key, dh_recv.as_bytes())?;
            self.root_key = new_rk;
            self.recv_ck = new_recv_ck;
            self.recv_n = 0;

            // Sending half: rotate our ratchet keypair
            self.prev_send_n = self.send_n;
            self.send_n = 0;
            let new_dh = StaticSecret::random_from_rng(OsRng);
            self.dh_send_pub = PublicAgreementKey::from(X25519Public::from(&new_dh));
            let dh_send = new_dh.diffie_hellman(&header.agreement_pub.as_x25519());
            let (new_rk2, new_send_ck) = kdf_rk(&self.root_key, dh_send.as_bytes())?;
            self.root_key = new_rk2;
            self.send_ck = new_send_ck;
            self.dh_send_secret = new_dh.to_bytes();
        }

        // Cache keys for any gap in the current chain
        self.skip_message_keys(header.n)?;

        // Case 1: derive the message key
        let (next_ck, mk) = kdf_ck(&self.recv_ck)?;
        self.recv_ck = next_ck;
        self.recv_n += 1;
        self.last_used = Utc::now();

        Ok(mk)
    }

    // ── Failure accounting ───────────────────────────────────────────────

    /// Record a failed decrypt (bad MAC above a successfully derived key).
    /// Returns true once the rekey-advisory threshold is reached.
    pub fn note_decrypt_failure(&mut self) -> bool {
        self.failed_decrypts = self.failed_decrypts.saturating_add(1);
        self.failed_decrypts >= REKEY_FAILURE_THRESHOLD
    }

    pub fn note_decrypt_success(&mut self) {
        self.failed_decrypts = 0;
    }

    pub fn our_ratchet_pub(&self) -> PublicAgreementKey {
        self.dh_send_pub
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    // ── Internal ─────────────────────────────────────────────────────────

    /// Cache message keys from `recv_n` up to (but not including) `until`.
    /// Rejects with `RatchetOverflow` rather than evicting: a session that
    /// blows the cap needs a rekey, not silently weakened bookkeeping.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let gap = until - self.recv_n;
        let cached = self.skipped.len() as u32;
        if cached + gap > self.max_skip {
            return Err(CryptoError::RatchetOverflow {
                needed: cached + gap,
                cap: self.max_skip,
            });
        }

        let chain_id = match self.dh_recv_pub {
            Some(k) => k,
            None => return Ok(()),
        };

        while self.recv_n < until {
            let (next_ck, mk) = kdf_ck(&self.recv_ck)?;
            self.recv_ck = next_ck;
            self.skipped.insert((chain_id, self.recv_n), mk);
            self.recv_n += 1;
        }
        Ok(())
    }
}

// ── KDF helpers (per Signal spec) ────────────────────────────────────────────

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
fn kdf_rk(rk: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    hk.expand(b"cypher-ratchet-rk", &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(b"cypher-ratchet-ck", &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// KDF_CK: chain key → (next_chain_key, message_key).
/// HMAC-based derivation per the Signal spec.
fn kdf_ck(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x01]); // chain key derivation constant
    let next_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x02]); // message key derivation constant
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((next_ck, mk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (RatchetSession, RatchetSession) {
        let shared_key = [42u8; 32];
        let bob_agreement = AgreementKeyPair::generate();

        let alice = RatchetSession::init_initiator(
            shared_key,
            &bob_agreement.public(),
            DEFAULT_MAX_SKIP,
        )
        .unwrap();
        let bob =
            RatchetSession::init_responder(shared_key, &bob_agreement, DEFAULT_MAX_SKIP).unwrap();
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = session_pair();

        // Alice sends 3 messages
        for i in 0..3 {
            let (header, mk_alice) = alice.encrypt_step().unwrap();
            let mk_bob = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk_alice, mk_bob, "message {i}: keys must match");
        }

        // Bob replies with 2 messages (triggers DH ratchet)
        for i in 0..2 {
            let (header, mk_bob) = bob.encrypt_step().unwrap();
            let mk_alice = alice.decrypt_step(&header).unwrap();
            assert_eq!(mk_bob, mk_alice, "bob message {i}: keys must match");
        }

        // Alice sends again (another DH ratchet)
        let (header, mk_a) = alice.encrypt_step().unwrap();
        let mk_b = bob.decrypt_step(&header).unwrap();
        assert_eq!(mk_a, mk_b);
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = session_pair();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        // Bob receives message 2 first (skipping 0 and 1)
        assert_eq!(mk2, bob.decrypt_step(&h2).unwrap());
        assert_eq!(bob.skipped_key_count(), 2);

        // Then 0 and 1, served from the skipped-key cache
        assert_eq!(mk0, bob.decrypt_step(&h0).unwrap());
        assert_eq!(mk1, bob.decrypt_step(&h1).unwrap());
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn dh_step_resets_counters_and_snapshots_pn() {
        let (mut alice, mut bob) = session_pair();

        for _ in 0..4 {
            let (h, _) = alice.encrypt_step().unwrap();
            bob.decrypt_step(&h).unwrap();
        }
        assert_eq!(alice.send_n, 4);

        // Bob's reply rotates Alice's chain on receipt
        let (h, _) = bob.encrypt_step().unwrap();
        alice.decrypt_step(&h).unwrap();

        assert_eq!(alice.send_n, 0, "send counter resets across a DH step");
        assert_eq!(alice.prev_send_n, 4, "PN equals the pre-step send counter");
    }

    #[test]
    fn skipped_key_cap_rejects_with_overflow() {
        let shared_key = [9u8; 32];
        let bob_agreement = AgreementKeyPair::generate();
        let mut alice =
            RatchetSession::init_initiator(shared_key, &bob_agreement.public(), 8).unwrap();
        let mut bob = RatchetSession::init_responder(shared_key, &bob_agreement, 8).unwrap();

        // Advance Alice far past the cap, deliver only the last message.
        let mut last = None;
        for _ in 0..12 {
            last = Some(alice.encrypt_step().unwrap());
        }
        let (header, _) = last.unwrap();
        let err = bob.decrypt_step(&header);
        assert!(matches!(err, Err(CryptoError::RatchetOverflow { .. })));
    }

    #[test]
    fn failure_counter_trips_after_two() {
        let (mut alice, _) = session_pair();
        assert!(!alice.note_decrypt_failure());
        assert!(alice.note_decrypt_failure());
        alice.note_decrypt_success();
        assert!(!alice.note_decrypt_failure());
    }

    #[test]
    fn state_survives_serialization() {
        let (mut alice, bob) = session_pair();
        let (h0, mk0) = alice.encrypt_step().unwrap();

        // Round-trip Bob through bytes, as the encrypted store does.
        let bytes = rmp_serde::to_vec_named(&bob).unwrap();
        let mut bob2: RatchetSession = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(mk0, bob2.decrypt_step(&h0).unwrap());
    }
}
