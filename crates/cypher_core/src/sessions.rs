//! Session manager: one ratchet per (peer user, peer device).
//!
//! Owns the `(peer, device) → RatchetSession` map, the X3DH bootstrap on
//! both sides, and the validated peer-config cache. All ratchet work runs
//! on a *copy* of the session which is persisted and only then committed to
//! memory — cancellation or a bad MAC can leave a session un-advanced,
//! never half-advanced, and a crash between persist and transport send
//! burns at most one message key (the receiver's skipped-key cache absorbs
//! the hole).
//!
//! Sends to the same device serialize on the per-session lock, which is
//! what keeps ratchet counters monotonic; distinct devices proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use cypher_crypto::{
    aead,
    identity::{DeviceIdentity, PublicSigningKey, UserConfig, Username},
    ratchet::{RatchetHeader, RatchetSession},
    x3dh::{self, HandshakeHeader},
    CryptoError,
};
use cypher_proto::{
    codec, envelope::WIRE_VERSION, DeviceAddress, Envelope, PushType,
};

use crate::{
    config::MessengerConfig,
    error::MessengerError,
    events::{EventBus, MessengerEvent},
    store::EncryptedStore,
    traits::{Namespace, Transport},
};

/// Pinned peer identity, persisted in the contacts namespace. A master-key
/// change is surfaced loudly (`ContactIdentityChanged`) and never silently
/// adopted as verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub user: Username,
    pub master_signing_pub: PublicSigningKey,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SessionSlot {
    ratchet: RatchetSession,
    /// Handshake header attached to every outbound envelope until the peer
    /// proves it has the session (first successful inbound decrypt).
    pending_handshake: Option<HandshakeHeader>,
}

struct CachedConfig {
    config: UserConfig,
    fetched_at: Instant,
}

pub struct SessionManager {
    identity: Arc<DeviceIdentity>,
    store: EncryptedStore,
    transport: Arc<dyn Transport>,
    events: EventBus,
    config: MessengerConfig,
    sessions: Mutex<HashMap<DeviceAddress, Arc<Mutex<SessionSlot>>>>,
    peer_configs: Mutex<HashMap<Username, CachedConfig>>,
}

impl SessionManager {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        store: EncryptedStore,
        transport: Arc<dyn Transport>,
        events: EventBus,
        config: MessengerConfig,
    ) -> Self {
        Self {
            identity,
            store,
            transport,
            events,
            config,
            sessions: Mutex::new(HashMap::new()),
            peer_configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_address(&self) -> DeviceAddress {
        DeviceAddress {
            user: self.identity.username.clone(),
            device: self.identity.device_id,
        }
    }

    // ── Peer configs ─────────────────────────────────────────────────────

    /// Fetch (or serve from cache) a user's validated config. `force`
    /// bypasses the TTL. An unvalidatable config is never cached.
    pub async fn peer_config(
        &self,
        user: &Username,
        force: bool,
    ) -> Result<UserConfig, MessengerError> {
        if !force {
            let cache = self.peer_configs.lock().await;
            if let Some(entry) = cache.get(user) {
                if entry.fetched_at.elapsed() < self.config.user_config_ttl {
                    return Ok(entry.config.clone());
                }
            }
        }

        let fetched = tokio::time::timeout(
            self.config.user_config_fetch_timeout,
            self.transport.read_key_bundle(user),
        )
        .await
        .map_err(|_| MessengerError::Timeout("user config fetch"))??;

        // Validate before caching; a bad signature also invalidates any
        // previously cached copy, forcing a re-fetch on the next use.
        if let Err(err) = fetched.validate_and_list_devices() {
            self.peer_configs.lock().await.remove(user);
            return Err(err.into());
        }
        self.track_contact(user, &fetched).await?;

        let mut cache = self.peer_configs.lock().await;
        cache.insert(
            user.clone(),
            CachedConfig {
                config: fetched.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(fetched)
    }

    /// Pin the peer's master key on first contact; surface any later change.
    async fn track_contact(
        &self,
        user: &Username,
        config: &UserConfig,
    ) -> Result<(), MessengerError> {
        if user == &self.identity.username {
            return Ok(());
        }
        let existing: Option<ContactRecord> =
            self.store.get_record(Namespace::Contacts, user.as_str()).await?;
        match existing {
            None => {
                let record = ContactRecord {
                    user: user.clone(),
                    master_signing_pub: config.master_signing_pub,
                    created_at: Utc::now(),
                };
                self.store
                    .put_record(Namespace::Contacts, user.as_str(), &record)
                    .await?;
                self.events
                    .emit(MessengerEvent::ContactCreated { user: user.clone() });
            }
            Some(record) if record.master_signing_pub != config.master_signing_pub => {
                let updated = ContactRecord {
                    master_signing_pub: config.master_signing_pub,
                    ..record
                };
                self.store
                    .put_record(Namespace::Contacts, user.as_str(), &updated)
                    .await?;
                self.events
                    .emit(MessengerEvent::ContactIdentityChanged { user: user.clone() });
            }
            Some(_) => {}
        }
        Ok(())
    }

    // ── Slot bookkeeping ─────────────────────────────────────────────────

    fn session_store_id(address: &DeviceAddress) -> String {
        address.to_string()
    }

    async fn lookup_slot(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<Arc<Mutex<SessionSlot>>>, MessengerError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(slot) = sessions.get(address) {
            return Ok(Some(slot.clone()));
        }
        let persisted: Option<SessionSlot> = self
            .store
            .get_record(Namespace::Sessions, &Self::session_store_id(address))
            .await?;
        match persisted {
            Some(slot) => {
                let slot = Arc::new(Mutex::new(slot));
                sessions.insert(address.clone(), slot.clone());
                Ok(Some(slot))
            }
            None => Ok(None),
        }
    }

    /// Get or establish the session toward `address`, performing the
    /// initiator side of X3DH against the peer's validated bundle.
    async fn ensure_slot(
        &self,
        address: &DeviceAddress,
    ) -> Result<Arc<Mutex<SessionSlot>>, MessengerError> {
        if let Some(slot) = self.lookup_slot(address).await? {
            return Ok(slot);
        }

        let config = self.peer_config(&address.user, false).await?;
        let bundle = config
            .device(address.device)?
            .ok_or_else(|| MessengerError::UnknownDevice(address.clone()))?;

        // One-time prekeys are a crypto-layer capability; the key-bundle
        // transport interface does not advertise them, so the server path
        // always runs 3-DH.
        let result = x3dh::initiate(&self.identity, &bundle, None)?;
        let ratchet = RatchetSession::init_initiator(
            result.shared_key,
            &bundle.agreement_pub,
            self.config.max_skipped_keys,
        )?;
        let slot = SessionSlot {
            ratchet,
            pending_handshake: Some(result.header),
        };
        self.store
            .put_record(Namespace::Sessions, &Self::session_store_id(address), &slot)
            .await?;

        let slot = Arc::new(Mutex::new(slot));
        let mut sessions = self.sessions.lock().await;
        Ok(sessions
            .entry(address.clone())
            .or_insert_with(|| slot.clone())
            .clone())
    }

    /// Build the responder side of a session from an inbound handshake.
    async fn adopt_responder_session(
        &self,
        from: &DeviceAddress,
        handshake: &HandshakeHeader,
    ) -> Result<Arc<Mutex<SessionSlot>>, MessengerError> {
        let bundle = self.validated_peer_bundle(from).await?;
        let shared_key = x3dh::respond(&self.identity, &bundle.signing_pub, handshake, None)?;
        let ratchet = RatchetSession::init_responder(
            shared_key,
            &self.identity.agreement,
            self.config.max_skipped_keys,
        )?;
        let slot = SessionSlot {
            ratchet,
            pending_handshake: None,
        };
        self.store
            .put_record(Namespace::Sessions, &Self::session_store_id(from), &slot)
            .await?;
        let slot = Arc::new(Mutex::new(slot));
        self.sessions.lock().await.insert(from.clone(), slot.clone());
        Ok(slot)
    }

    /// Look up the peer's validated bundle, refreshing the cached config
    /// once if the device is not yet known.
    async fn validated_peer_bundle(
        &self,
        address: &DeviceAddress,
    ) -> Result<cypher_crypto::identity::DeviceBundle, MessengerError> {
        let config = self.peer_config(&address.user, false).await?;
        if let Some(bundle) = config.device(address.device)? {
            return Ok(bundle);
        }
        let refreshed = self.peer_config(&address.user, true).await?;
        refreshed
            .device(address.device)?
            .ok_or_else(|| MessengerError::UnknownDevice(address.clone()))
    }

    // ── Frame sealing (shared by envelopes and P2P frames) ───────────────

    /// Advance the send chain once and seal `plaintext`. Returns the header,
    /// the ciphertext, and any handshake header that must ride along.
    pub async fn seal_frame(
        &self,
        to: &DeviceAddress,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(RatchetHeader, Vec<u8>, Option<HandshakeHeader>), MessengerError> {
        let slot = self.ensure_slot(to).await?;
        let mut guard = slot.lock().await;

        let mut working = guard.clone();
        let (header, message_key) = working.ratchet.encrypt_step()?;
        let ciphertext = aead::encrypt(&message_key, plaintext, aad)?;
        let handshake = working.pending_handshake.clone();

        // Persist first, then commit to memory: the store is the commit
        // point, so a cancellation at the await above leaves the session
        // un-advanced everywhere.
        self.store
            .put_record(Namespace::Sessions, &Self::session_store_id(to), &working)
            .await?;
        *guard = working;
        Ok((header, ciphertext, handshake))
    }

    /// Open a sealed frame from `from`, creating the responder session on
    /// first contact. Ratchet state commits only after the MAC checks out.
    pub async fn open_frame(
        &self,
        from: &DeviceAddress,
        header: &RatchetHeader,
        ciphertext: &[u8],
        aad: &[u8],
        handshake: Option<&HandshakeHeader>,
    ) -> Result<Vec<u8>, MessengerError> {
        let slot = match self.lookup_slot(from).await? {
            Some(slot) => slot,
            None => match handshake {
                Some(hs) => self.adopt_responder_session(from, hs).await?,
                None => return Err(MessengerError::OutOfOrder),
            },
        };

        let mut guard = slot.lock().await;
        let mut working = guard.clone();

        let step = working.ratchet.decrypt_step(header);
        let message_key = match step {
            Ok(key) => key,
            Err(CryptoError::RatchetOverflow { .. }) => {
                self.events.emit(MessengerEvent::Rekey { address: from.clone() });
                return Err(MessengerError::RatchetOverflow);
            }
            Err(other) => return Err(other.into()),
        };

        match aead::decrypt(&message_key, ciphertext, aad) {
            Ok(plaintext) => {
                working.ratchet.note_decrypt_success();
                working.pending_handshake = None;
                self.store
                    .put_record(Namespace::Sessions, &Self::session_store_id(from), &working)
                    .await?;
                *guard = working;
                Ok(plaintext.to_vec())
            }
            Err(_) => {
                // Both sides initiated simultaneously: adopt the session of
                // the lexicographically smaller address as canonical. The
                // larger side rebuilds itself as responder and retries once.
                if let Some(hs) = handshake {
                    if guard.pending_handshake.is_some() && *from < self.local_address() {
                        drop(guard);
                        let slot = self.adopt_responder_session(from, hs).await?;
                        let mut guard = slot.lock().await;
                        let mut working = guard.clone();
                        let message_key = working.ratchet.decrypt_step(header)?;
                        if let Ok(plaintext) = aead::decrypt(&message_key, ciphertext, aad) {
                            working.ratchet.note_decrypt_success();
                            self.store
                                .put_record(
                                    Namespace::Sessions,
                                    &Self::session_store_id(from),
                                    &working,
                                )
                                .await?;
                            *guard = working;
                            return Ok(plaintext.to_vec());
                        }
                        return Err(MessengerError::InvalidMac);
                    }
                }
                // Session stays as-is; two strikes suggest a rekey.
                if guard.ratchet.note_decrypt_failure() {
                    self.events.emit(MessengerEvent::Rekey { address: from.clone() });
                }
                Err(MessengerError::InvalidMac)
            }
        }
    }

    // ── Envelope convenience ─────────────────────────────────────────────

    fn envelope_aad(from: &DeviceAddress, to: &DeviceAddress, remote_id: &str) -> Vec<u8> {
        format!("{from}|{to}|{remote_id}").into_bytes()
    }

    /// Seal padded plaintext into a wire envelope for one device.
    pub async fn encrypt(
        &self,
        to: &DeviceAddress,
        plaintext: &[u8],
        remote_id: &str,
        push_type: PushType,
    ) -> Result<Envelope, MessengerError> {
        let from = self.local_address();
        let padded = codec::pad_to_bucket(plaintext, self.config.padding);
        let aad = Self::envelope_aad(&from, to, remote_id);
        let (header, ciphertext, handshake) = self.seal_frame(to, &padded, &aad).await?;
        Ok(Envelope {
            version: WIRE_VERSION,
            from,
            to: to.clone(),
            remote_id: remote_id.to_string(),
            push_type,
            header,
            ciphertext,
            handshake,
        })
    }

    /// Decrypt a wire envelope back to unpadded plaintext.
    pub async fn decrypt(
        &self,
        from: &DeviceAddress,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, MessengerError> {
        let aad = Self::envelope_aad(&envelope.from, &envelope.to, &envelope.remote_id);
        let padded = self
            .open_frame(
                from,
                &envelope.header,
                &envelope.ciphertext,
                &aad,
                envelope.handshake.as_ref(),
            )
            .await?;
        Ok(codec::unpad(&padded)?)
    }

    /// Tear the session down; the next outbound message re-establishes it.
    pub async fn rekey(&self, address: &DeviceAddress) -> Result<(), MessengerError> {
        self.sessions.lock().await.remove(address);
        self.store
            .delete(Namespace::Sessions, &Self::session_store_id(address))
            .await?;
        self.events.emit(MessengerEvent::Rekey { address: address.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::traits::InboundEnvelope;
    use async_trait::async_trait;
    use cypher_crypto::identity::{build_user_config, generate_device_identity};
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;

    struct StubTransport {
        bundles: StdHashMap<Username, UserConfig>,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn send_message(
            &self,
            _to: &DeviceAddress,
            _envelope: Vec<u8>,
            _push: PushType,
        ) -> Result<(), MessengerError> {
            Ok(())
        }

        async fn read_key_bundle(&self, user: &Username) -> Result<UserConfig, MessengerError> {
            self.bundles
                .get(user)
                .cloned()
                .ok_or_else(|| MessengerError::TransportUnavailable(format!("no bundle for {user}")))
        }

        async fn publish_key_bundle(&self, _config: &UserConfig) -> Result<(), MessengerError> {
            Ok(())
        }

        async fn subscribe(&self) -> Result<mpsc::Receiver<InboundEnvelope>, MessengerError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    async fn manager_for(
        identity: DeviceIdentity,
        bundles: StdHashMap<Username, UserConfig>,
    ) -> SessionManager {
        let store = EncryptedStore::new(Arc::new(MemoryStorage::new()));
        store.unlock(b"pw").await.unwrap();
        SessionManager::new(
            Arc::new(identity),
            store,
            Arc::new(StubTransport { bundles }),
            EventBus::new(16),
            MessengerConfig::default(),
        )
    }

    async fn manager_pair() -> (SessionManager, SessionManager) {
        let alice = generate_device_identity(Username::new("alice"), true);
        let bob = generate_device_identity(Username::new("bob"), true);
        let mut bundles = StdHashMap::new();
        bundles.insert(
            alice.username.clone(),
            build_user_config(&alice, &[]).unwrap(),
        );
        bundles.insert(bob.username.clone(), build_user_config(&bob, &[]).unwrap());

        (
            manager_for(alice, bundles.clone()).await,
            manager_for(bob, bundles).await,
        )
    }

    #[tokio::test]
    async fn envelope_roundtrip_establishes_both_sides() {
        let (alice, bob) = manager_pair().await;
        let bob_addr = bob.local_address();

        let envelope = alice
            .encrypt(&bob_addr, b"hello bob", "rid-1", PushType::Message)
            .await
            .unwrap();
        assert!(envelope.handshake.is_some(), "first envelope carries the handshake");

        let plaintext = bob.decrypt(&alice.local_address(), &envelope).await.unwrap();
        assert_eq!(plaintext, b"hello bob");

        // Reply flows over the freshly established responder session.
        let reply = bob
            .encrypt(&alice.local_address(), b"hi alice", "rid-2", PushType::Message)
            .await
            .unwrap();
        let plaintext = alice.decrypt(&bob_addr, &reply).await.unwrap();
        assert_eq!(plaintext, b"hi alice");
    }

    #[tokio::test]
    async fn handshake_stops_riding_after_first_inbound() {
        let (alice, bob) = manager_pair().await;
        let bob_addr = bob.local_address();
        let alice_addr = alice.local_address();

        let e1 = alice
            .encrypt(&bob_addr, b"one", "r1", PushType::Message)
            .await
            .unwrap();
        bob.decrypt(&alice_addr, &e1).await.unwrap();
        let reply = bob
            .encrypt(&alice_addr, b"two", "r2", PushType::Message)
            .await
            .unwrap();
        alice.decrypt(&bob_addr, &reply).await.unwrap();

        let e2 = alice
            .encrypt(&bob_addr, b"three", "r3", PushType::Message)
            .await
            .unwrap();
        assert!(e2.handshake.is_none(), "established sessions drop the handshake");
    }

    #[tokio::test]
    async fn unknown_device_is_reported() {
        let (alice, bob) = manager_pair().await;
        let ghost = DeviceAddress {
            user: bob.local_address().user,
            device: cypher_crypto::identity::DeviceId::generate(),
        };
        let err = alice
            .encrypt(&ghost, b"x", "r1", PushType::Message)
            .await;
        assert!(matches!(err, Err(MessengerError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn tampered_envelope_keeps_session_alive() {
        let (alice, bob) = manager_pair().await;
        let bob_addr = bob.local_address();
        let alice_addr = alice.local_address();

        let good = alice
            .encrypt(&bob_addr, b"good", "r1", PushType::Message)
            .await
            .unwrap();
        bob.decrypt(&alice_addr, &good).await.unwrap();

        let mut bad = alice
            .encrypt(&bob_addr, b"bad", "r2", PushType::Message)
            .await
            .unwrap();
        let last = bad.ciphertext.len() - 1;
        bad.ciphertext[last] ^= 0xFF;
        let err = bob.decrypt(&alice_addr, &bad).await;
        assert!(matches!(err, Err(MessengerError::InvalidMac)));

        // The untampered copy still decrypts: state did not advance.
        bad.ciphertext[last] ^= 0xFF;
        assert_eq!(bob.decrypt(&alice_addr, &bad).await.unwrap(), b"bad");
    }

    #[tokio::test]
    async fn sessions_survive_manager_restart() {
        let alice = generate_device_identity(Username::new("alice"), true);
        let bob = generate_device_identity(Username::new("bob"), true);
        let mut bundles = StdHashMap::new();
        bundles.insert(alice.username.clone(), build_user_config(&alice, &[]).unwrap());
        bundles.insert(bob.username.clone(), build_user_config(&bob, &[]).unwrap());

        let bob_identity = Arc::new(bob);
        let adapter = Arc::new(MemoryStorage::new());
        let store = EncryptedStore::new(adapter.clone());
        store.unlock(b"pw").await.unwrap();

        let alice_mgr = manager_for(alice, bundles.clone()).await;
        let bob_mgr = SessionManager::new(
            bob_identity.clone(),
            store.clone(),
            Arc::new(StubTransport { bundles: bundles.clone() }),
            EventBus::new(16),
            MessengerConfig::default(),
        );

        let bob_addr = bob_mgr.local_address();
        let e1 = alice_mgr
            .encrypt(&bob_addr, b"one", "r1", PushType::Message)
            .await
            .unwrap();
        bob_mgr.decrypt(&alice_mgr.local_address(), &e1).await.unwrap();
        drop(bob_mgr);

        // Same store, fresh manager: the persisted session keeps decrypting.
        let bob_mgr2 = SessionManager::new(
            bob_identity,
            store,
            Arc::new(StubTransport { bundles }),
            EventBus::new(16),
            MessengerConfig::default(),
        );
        let e2 = alice_mgr
            .encrypt(&bob_addr, b"two", "r2", PushType::Message)
            .await
            .unwrap();
        assert_eq!(
            bob_mgr2.decrypt(&alice_mgr.local_address(), &e2).await.unwrap(),
            b"two"
        );
    }
}
