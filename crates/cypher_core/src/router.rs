//! Message router: outbound fan-out and inbound dispatch.
//!
//! Outbound: resolve the recipient set, enumerate every validated device of
//! every recipient, seal one envelope per device, and hand each to the
//! transport. Per-device failures retry with exponential backoff; a device
//! that exhausts its retries is quarantined and surfaced on the event bus
//! while the rest of the fan-out proceeds.
//!
//! Inbound: decrypt, decode, resolve the conversation, run the host hook,
//! and insert idempotently keyed by (sender device, remote id). Inbound
//! envelopes are processed one at a time per messenger, which serializes
//! ratchet advancement per (peer, device).

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use cypher_crypto::identity::{DeviceIdentity, Username};
use cypher_proto::{
    codec,
    message::magic,
    CypherMessage, DeviceAddress, Envelope, GroupId, MessageTarget, MessageType, PushType,
    SingleCypherMessage,
};

use crate::{
    config::MessengerConfig,
    error::MessengerError,
    events::{EventBus, MessengerEvent},
    groups::GroupManager,
    p2p::P2pManager,
    sessions::SessionManager,
    store::EncryptedStore,
    traits::{
        CancelToken, InboundEnvelope, MessageHooks, Namespace, ReceiveDisposition,
        SendDisposition, Transport,
    },
};

// ── Conversations ────────────────────────────────────────────────────────────

/// Identity of a conversation on this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKey {
    Private(Username),
    Group(GroupId),
    /// The user's own cross-device notes channel.
    Own,
}

impl ConversationKey {
    pub fn storage_key(&self) -> String {
        match self {
            ConversationKey::Private(user) => format!("private:{user}"),
            ConversationKey::Group(id) => format!("group:{id}"),
            ConversationKey::Own => "self".to_string(),
        }
    }

    fn for_target(target: &MessageTarget) -> Self {
        match target {
            MessageTarget::PrivateChat(user) => ConversationKey::Private(user.clone()),
            MessageTarget::GroupChat(id) => ConversationKey::Group(id.clone()),
            MessageTarget::CurrentUser => ConversationKey::Own,
        }
    }
}

/// Conversation lifecycle record. Opaque to the protocol; the router only
/// guarantees creation events and dedup identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub conversation: ConversationKey,
    pub participants: Vec<Username>,
    pub created_at: DateTime<Utc>,
}

/// One entry of a conversation's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: SingleCypherMessage,
    pub sender: DeviceAddress,
    pub received_at: DateTime<Utc>,
}

// ── Router ───────────────────────────────────────────────────────────────────

pub struct Router {
    identity: Arc<DeviceIdentity>,
    store: EncryptedStore,
    sessions: Arc<SessionManager>,
    groups: Arc<GroupManager>,
    hooks: Arc<dyn MessageHooks>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    config: MessengerConfig,
    quarantined: Mutex<HashSet<DeviceAddress>>,
    /// Wired in by the messenger after construction (the P2P layer needs
    /// the router's inbound intake and vice versa).
    p2p: OnceLock<Arc<P2pManager>>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<DeviceIdentity>,
        store: EncryptedStore,
        sessions: Arc<SessionManager>,
        groups: Arc<GroupManager>,
        hooks: Arc<dyn MessageHooks>,
        transport: Arc<dyn Transport>,
        events: EventBus,
        config: MessengerConfig,
    ) -> Self {
        Self {
            identity,
            store,
            sessions,
            groups,
            hooks,
            transport,
            events,
            config,
            quarantined: Mutex::new(HashSet::new()),
            p2p: OnceLock::new(),
        }
    }

    pub fn attach_p2p(&self, p2p: Arc<P2pManager>) {
        let _ = self.p2p.set(p2p);
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Fan a message out to every device of every recipient.
    ///
    /// Per-device failures quarantine that device and keep going; the call
    /// only errs on cancellation, group-rule violations, or failures before
    /// dispatch starts.
    pub async fn send(
        self: &Arc<Self>,
        message: SingleCypherMessage,
        cancel: Option<CancelToken>,
    ) -> Result<(), MessengerError> {
        if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(MessengerError::Cancelled);
        }

        let local = self.sessions.local_address();
        let recipients: Vec<Username> = match &message.target {
            MessageTarget::PrivateChat(peer) => {
                if peer == &local.user {
                    return Err(MessengerError::Forbidden(
                        "a private chat with yourself is not allowed".into(),
                    ));
                }
                vec![peer.clone(), local.user.clone()]
            }
            MessageTarget::GroupChat(id) => self.groups.members_for_send(id).await?,
            MessageTarget::CurrentUser => vec![local.user.clone()],
        };

        match self.hooks.on_send_message(&message).await {
            SendDisposition::Drop => {
                tracing::debug!(
                    target: "cypher_core",
                    event = "send_dropped_by_hook",
                    remote_id = %message.remote_id,
                );
                return Ok(());
            }
            SendDisposition::SaveAndSend => {
                self.persist_outbound(&message).await?;
            }
            SendDisposition::Send => {}
        }

        // Enumerate target devices from validated configs, excluding the
        // local device and anything quarantined.
        let mut targets = Vec::new();
        {
            let quarantined = self.quarantined.lock().await;
            for user in &recipients {
                let config = self.sessions.peer_config(user, false).await?;
                for bundle in config.validate_and_list_devices()? {
                    let address = DeviceAddress {
                        user: user.clone(),
                        device: bundle.device_id,
                    };
                    if address != local && !quarantined.contains(&address) {
                        targets.push(address);
                    }
                }
            }
        }

        let plaintext = Arc::new(codec::encode(&CypherMessage::Single(message.clone()))?);
        let push = match message.message_type {
            MessageType::Magic => PushType::Silent,
            _ => PushType::Message,
        };

        let mut join = JoinSet::new();
        let mut spawned = 0usize;
        let mut cancelled = false;
        for to in targets.iter().cloned() {
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                cancelled = true;
                break;
            }
            let router = Arc::clone(self);
            let plaintext = Arc::clone(&plaintext);
            let remote_id = message.remote_id.clone();
            join.spawn(async move { router.send_to_device(to, plaintext, remote_id, push).await });
            spawned += 1;
        }

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        while let Some(result) = join.join_next().await {
            let Ok((to, outcome)) = result else { continue };
            match outcome {
                Ok(()) => delivered.push(to),
                Err(err) => {
                    tracing::warn!(
                        target: "cypher_core",
                        event = "device_send_failed",
                        to = %to,
                        error = %err,
                    );
                    failed.push(to);
                }
            }
        }

        if cancelled {
            if delivered.is_empty() && spawned == 0 {
                return Err(MessengerError::Cancelled);
            }
            failed.extend(targets.into_iter().skip(spawned));
            return Err(MessengerError::PartiallySent { delivered, failed });
        }
        Ok(())
    }

    /// One device's delivery path: a single ratchet step, then transport
    /// attempts with exponential backoff. Retries reuse the same envelope —
    /// re-encrypting would burn ratchet keys for nothing and break the
    /// receiver-side dedup contract.
    async fn send_to_device(
        self: Arc<Self>,
        to: DeviceAddress,
        plaintext: Arc<Vec<u8>>,
        remote_id: String,
        push: PushType,
    ) -> (DeviceAddress, Result<(), MessengerError>) {
        let envelope = match self.sessions.encrypt(&to, &plaintext, &remote_id, push).await {
            Ok(envelope) => envelope,
            Err(err) => return (to, Err(err)),
        };
        let bytes = match codec::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => return (to, Err(err.into())),
        };

        // Prefer an authenticated P2P channel; fall through to the server
        // transport on any failure.
        if let Some(p2p) = self.p2p.get() {
            if p2p.try_send_envelope(&to, &bytes).await {
                return (to, Ok(()));
            }
        }

        for attempt in 0..self.config.send_retries {
            let sent = tokio::time::timeout(
                self.config.transport_send_timeout,
                self.transport.send_message(&to, bytes.clone(), push),
            )
            .await;
            match sent {
                Ok(Ok(())) => return (to, Ok(())),
                Ok(Err(err)) => {
                    tracing::debug!(
                        target: "cypher_core",
                        event = "transport_send_retry",
                        to = %to,
                        attempt,
                        error = %err,
                    );
                }
                Err(_) => {
                    tracing::debug!(
                        target: "cypher_core",
                        event = "transport_send_timeout",
                        to = %to,
                        attempt,
                    );
                }
            }
            if attempt + 1 < self.config.send_retries {
                tokio::time::sleep(self.config.backoff_delay(attempt)).await;
            }
        }

        self.quarantined.lock().await.insert(to.clone());
        self.events
            .emit(MessengerEvent::DeviceQuarantined { address: to.clone() });
        (
            to,
            Err(MessengerError::TransportUnavailable(
                "send retries exhausted".into(),
            )),
        )
    }

    /// Lift a quarantine (e.g. after the embedder observed the device come
    /// back online).
    pub async fn clear_quarantine(&self, address: &DeviceAddress) {
        self.quarantined.lock().await.remove(address);
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Process one envelope from the transport. Malformed, misaddressed,
    /// undecryptable, or duplicate envelopes are dropped without failing
    /// the intake loop.
    pub async fn receive(&self, inbound: InboundEnvelope) -> Result<(), MessengerError> {
        let envelope: Envelope = match codec::decode(&inbound.bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(target: "cypher_core", event = "envelope_undecodable", error = %err);
                return Ok(());
            }
        };
        if let Err(err) = envelope.check_version() {
            tracing::warn!(target: "cypher_core", event = "envelope_bad_version", error = %err);
            return Ok(());
        }

        let local = self.sessions.local_address();
        if envelope.to != local {
            tracing::debug!(target: "cypher_core", event = "envelope_misrouted", to = %envelope.to);
            return Ok(());
        }
        if envelope.from != inbound.sender {
            tracing::warn!(
                target: "cypher_core",
                event = "envelope_sender_mismatch",
                claimed = %envelope.from,
                actual = %inbound.sender,
            );
            return Ok(());
        }
        let sender = inbound.sender;

        // Redelivery of an already-processed (sender, remote_id) is a no-op.
        let seen_id = format!("seen/{}/{}", sender, envelope.remote_id);
        if self
            .store
            .get_record::<bool>(Namespace::Messages, &seen_id)
            .await?
            .is_some()
        {
            tracing::debug!(
                target: "cypher_core",
                event = "envelope_duplicate",
                sender = %sender,
                remote_id = %envelope.remote_id,
            );
            return Ok(());
        }

        let plaintext = match self.sessions.decrypt(&sender, &envelope).await {
            Ok(plaintext) => plaintext,
            Err(MessengerError::UnknownDevice(address)) => {
                self.events
                    .emit(MessengerEvent::DeviceRegistrationRequested { address });
                return Ok(());
            }
            // Fatal for the message, not for the session or the intake loop.
            Err(
                err @ (MessengerError::InvalidMac
                | MessengerError::RatchetOverflow
                | MessengerError::OutOfOrder),
            ) => {
                tracing::warn!(
                    target: "cypher_core",
                    event = "envelope_undecryptable",
                    sender = %sender,
                    error = %err,
                );
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        let wire: CypherMessage = match codec::decode(&plaintext) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(target: "cypher_core", event = "payload_undecodable", error = %err);
                return Ok(());
            }
        };

        for message in wire.into_messages() {
            self.dispatch_single(&sender, message).await?;
        }

        self.store
            .put_record(Namespace::Messages, &seen_id, &true)
            .await?;
        Ok(())
    }

    async fn dispatch_single(
        &self,
        sender: &DeviceAddress,
        message: SingleCypherMessage,
    ) -> Result<(), MessengerError> {
        let local = self.sessions.local_address();

        let conversation = match &message.target {
            MessageTarget::PrivateChat(peer) => {
                if sender.user == local.user {
                    // Our own other device's copy of an outbound message.
                    ConversationKey::Private(peer.clone())
                } else {
                    ConversationKey::Private(sender.user.clone())
                }
            }
            MessageTarget::GroupChat(id) => {
                if let Some(kicked_at) = self.groups.kicked_since(id, &sender.user).await? {
                    if message.sent_date > kicked_at {
                        tracing::warn!(
                            target: "cypher_core",
                            event = "message_dropped",
                            reason = "kicked",
                            sender = %sender,
                            group = %id,
                        );
                        return Ok(());
                    }
                }
                ConversationKey::Group(id.clone())
            }
            MessageTarget::CurrentUser => ConversationKey::Own,
        };

        if message.message_type == MessageType::Magic {
            self.handle_magic(sender, &message).await;
            // Plugins may observe magic traffic via the hook; it is never
            // persisted to a conversation log.
            let _ = self.hooks.on_receive_message(&message).await;
            return Ok(());
        }

        if let MessageTarget::GroupChat(id) = &message.target {
            match self.groups.get(id).await? {
                None => {
                    tracing::debug!(
                        target: "cypher_core",
                        event = "message_for_unknown_group",
                        group = %id,
                    );
                    return Ok(());
                }
                Some(config) => {
                    if !config.is_member(&sender.user) {
                        tracing::warn!(
                            target: "cypher_core",
                            event = "message_dropped",
                            reason = "not_a_member",
                            sender = %sender,
                            group = %id,
                        );
                        return Ok(());
                    }
                    if !config.is_member(&local.user) {
                        return Ok(());
                    }
                }
            }
        }

        if self.hooks.on_receive_message(&message).await == ReceiveDisposition::Ignore {
            return Ok(());
        }

        self.ensure_conversation(&conversation).await?;
        self.insert_message(&conversation, sender, &message).await?;
        Ok(())
    }

    /// Magic subtypes the core itself consumes.
    async fn handle_magic(&self, sender: &DeviceAddress, message: &SingleCypherMessage) {
        match message.subtype.as_deref() {
            Some(magic::GROUP_UPDATE) => {
                if let Err(err) = self.apply_group_update(sender, message).await {
                    tracing::warn!(
                        target: "cypher_core",
                        event = "group_update_rejected",
                        sender = %sender,
                        error = %err,
                    );
                }
            }
            Some(magic::P2P_OFFER) => {
                if let Some(p2p) = self.p2p.get() {
                    p2p.clone()
                        .connect_from_offer(sender.clone(), message.metadata.clone());
                }
            }
            _ => {} // plugin territory; the hook already saw it
        }
    }

    async fn apply_group_update(
        &self,
        sender: &DeviceAddress,
        message: &SingleCypherMessage,
    ) -> Result<(), MessengerError> {
        let value = message
            .metadata
            .get("config")
            .ok_or_else(|| MessengerError::Corrupted("group update without config".into()))?;
        let signed = serde_json::from_value(value.clone())
            .map_err(|e| MessengerError::Corrupted(format!("group update config: {e}")))?;

        let config = self.sessions.peer_config(&sender.user, false).await?;
        let sender_keys: Vec<_> = config
            .validate_and_list_devices()?
            .into_iter()
            .map(|bundle| bundle.signing_pub)
            .collect();
        self.groups
            .apply_update(&sender.user, &sender_keys, signed)
            .await?;
        Ok(())
    }

    // ── Conversation log ─────────────────────────────────────────────────

    async fn persist_outbound(&self, message: &SingleCypherMessage) -> Result<(), MessengerError> {
        let local = self.sessions.local_address();
        let conversation = ConversationKey::for_target(&message.target);
        self.ensure_conversation(&conversation).await?;
        self.insert_message(&conversation, &local, message).await?;
        Ok(())
    }

    pub async fn ensure_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<(), MessengerError> {
        let id = key.storage_key();
        if self
            .store
            .get_record::<ChatRecord>(Namespace::Conversations, &id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let participants = match key {
            ConversationKey::Private(peer) => {
                vec![self.identity.username.clone(), peer.clone()]
            }
            ConversationKey::Group(group_id) => match self.groups.get(group_id).await? {
                Some(config) => config.members.into_iter().collect(),
                None => Vec::new(),
            },
            ConversationKey::Own => vec![self.identity.username.clone()],
        };
        let record = ChatRecord {
            conversation: key.clone(),
            participants,
            created_at: Utc::now(),
        };
        self.store
            .put_record(Namespace::Conversations, &id, &record)
            .await?;
        self.events.emit(MessengerEvent::ConversationCreated {
            conversation: key.clone(),
        });
        Ok(())
    }

    pub async fn conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ChatRecord>, MessengerError> {
        self.store
            .get_record(Namespace::Conversations, &key.storage_key())
            .await
    }

    /// Idempotent insert keyed by (conversation, sender device, remote id).
    /// Returns false (and emits nothing) for a duplicate.
    async fn insert_message(
        &self,
        conversation: &ConversationKey,
        sender: &DeviceAddress,
        message: &SingleCypherMessage,
    ) -> Result<bool, MessengerError> {
        let id = format!(
            "log/{}/{}/{}",
            conversation.storage_key(),
            sender.device,
            message.remote_id
        );
        if self
            .store
            .get_record::<StoredMessage>(Namespace::Messages, &id)
            .await?
            .is_some()
        {
            tracing::debug!(
                target: "cypher_core",
                event = "message_duplicate",
                remote_id = %message.remote_id,
            );
            return Ok(false);
        }

        let stored = StoredMessage {
            message: message.clone(),
            sender: sender.clone(),
            received_at: Utc::now(),
        };
        self.store
            .put_record(Namespace::Messages, &id, &stored)
            .await?;
        self.events.emit(MessengerEvent::MessageCreated {
            conversation: conversation.clone(),
            sender: sender.clone(),
            remote_id: message.remote_id.clone(),
        });
        Ok(true)
    }

    /// The conversation's log in send order: (order, sender device,
    /// remote id) — the same tuple that breaks cross-device order ties.
    pub async fn messages(
        &self,
        conversation: &ConversationKey,
    ) -> Result<Vec<StoredMessage>, MessengerError> {
        let prefix = format!("log/{}/", conversation.storage_key());
        let ids = self.store.list(Namespace::Messages).await?;
        let mut log = Vec::new();
        for id in ids.into_iter().filter(|id| id.starts_with(&prefix)) {
            if let Some(entry) = self
                .store
                .get_record::<StoredMessage>(Namespace::Messages, &id)
                .await?
            {
                log.push(entry);
            }
        }
        log.sort_by(|a, b| {
            (a.message.order, a.sender.device, a.message.remote_id.as_str()).cmp(&(
                b.message.order,
                b.sender.device,
                b.message.remote_id.as_str(),
            ))
        });
        Ok(log)
    }
}
