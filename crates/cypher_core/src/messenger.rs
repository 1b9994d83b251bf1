//! The messenger instance: owns every subsystem and wires the
//! collaborators together.
//!
//! Ownership is strictly tree-shaped — sessions, router, groups, P2P and
//! the event bus are children of this instance, referenced through `Arc`
//! handles with no cycles; dropping the messenger tears everything down
//! deterministically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use cypher_crypto::identity::{
    build_user_config, DeviceBundle, DeviceIdentity, Signed, Username,
};
use cypher_proto::{
    message::magic, DeviceAddress, GroupConfig, GroupId, MessageTarget, SingleCypherMessage,
};

use crate::{
    config::MessengerConfig,
    error::MessengerError,
    events::{EventBus, MessengerEvent},
    groups::GroupManager,
    p2p::{P2pChannel, P2pManager},
    router::{ChatRecord, ConversationKey, Router, StoredMessage},
    sessions::SessionManager,
    store::EncryptedStore,
    traits::{
        CancelToken, MessageHooks, Namespace, P2pConnection, P2pTransportFactory, StorageAdapter,
        Transport,
    },
};

const LOCAL_IDENTITY_ID: &str = "local";
const ORDER_COUNTER_ID: &str = "order.next";

/// Everything the embedder plugs in.
pub struct Collaborators {
    pub storage: Arc<dyn StorageAdapter>,
    pub transport: Arc<dyn Transport>,
    pub hooks: Arc<dyn MessageHooks>,
    pub p2p_factory: Option<Arc<dyn P2pTransportFactory>>,
}

pub struct CypherMessenger {
    identity: Arc<DeviceIdentity>,
    store: EncryptedStore,
    sessions: Arc<SessionManager>,
    router: Arc<Router>,
    groups: Arc<GroupManager>,
    p2p: Arc<P2pManager>,
    events: EventBus,
    transport: Arc<dyn Transport>,
    order: Mutex<u64>,
    intake: JoinHandle<()>,
}

impl CypherMessenger {
    /// Bring a device online: unlock the store, adopt (or persist) the
    /// identity, publish the key bundle when this is the master device,
    /// and start consuming the transport.
    pub async fn register(
        identity: DeviceIdentity,
        password: &[u8],
        collaborators: Collaborators,
        config: MessengerConfig,
    ) -> Result<Self, MessengerError> {
        let store = EncryptedStore::new(collaborators.storage);
        store.unlock(password).await?;

        // A previously enrolled install keeps its keys; the caller's fresh
        // identity only lands on first run.
        let identity = match store
            .get_record::<DeviceIdentity>(Namespace::Devices, LOCAL_IDENTITY_ID)
            .await?
        {
            Some(stored) => Arc::new(stored),
            None => {
                store
                    .put_record(Namespace::Devices, LOCAL_IDENTITY_ID, &identity)
                    .await?;
                Arc::new(identity)
            }
        };

        let events = EventBus::new(config.event_capacity);
        let transport = collaborators.transport;
        let sessions = Arc::new(SessionManager::new(
            identity.clone(),
            store.clone(),
            transport.clone(),
            events.clone(),
            config.clone(),
        ));
        let groups = Arc::new(GroupManager::new(
            identity.clone(),
            store.clone(),
            events.clone(),
        ));
        let router = Arc::new(Router::new(
            identity.clone(),
            store.clone(),
            sessions.clone(),
            groups.clone(),
            collaborators.hooks,
            transport.clone(),
            events.clone(),
            config.clone(),
        ));

        let (p2p_tx, mut p2p_rx) = mpsc::channel(64);
        let p2p = P2pManager::new(
            sessions.clone(),
            transport.clone(),
            events.clone(),
            config.clone(),
            collaborators.p2p_factory,
            p2p_tx,
        );
        router.attach_p2p(p2p.clone());

        // Subscribe before announcing ourselves so nothing sent in response
        // to the published bundle is missed.
        let mut transport_rx = transport.subscribe().await?;

        if identity.is_master {
            let config_to_publish = match transport.read_key_bundle(&identity.username).await {
                Ok(existing)
                    if existing.master_signing_pub == identity.signing.public() =>
                {
                    existing
                }
                _ => build_user_config(&identity, &[])?,
            };
            transport.publish_key_bundle(&config_to_publish).await?;
        }
        events.emit(MessengerEvent::DeviceRegistered {
            address: DeviceAddress {
                user: identity.username.clone(),
                device: identity.device_id,
            },
        });

        let order = Mutex::new(
            store
                .get_record::<u64>(Namespace::CustomConfig, ORDER_COUNTER_ID)
                .await?
                .unwrap_or(0),
        );

        // The intake loop is the serial executor of the inbound path:
        // envelopes (server and P2P alike) are processed one at a time.
        let intake_router = router.clone();
        let intake = tokio::spawn(async move {
            loop {
                let inbound = tokio::select! {
                    received = transport_rx.recv() => received,
                    received = p2p_rx.recv() => received,
                };
                let Some(inbound) = inbound else { break };
                if let Err(err) = intake_router.receive(inbound).await {
                    tracing::error!(
                        target: "cypher_core",
                        event = "inbound_dispatch_failed",
                        error = %err,
                    );
                }
            }
        });

        Ok(Self {
            identity,
            store,
            sessions,
            router,
            groups,
            p2p,
            events,
            transport,
            order,
            intake,
        })
    }

    pub fn local_address(&self) -> DeviceAddress {
        DeviceAddress {
            user: self.identity.username.clone(),
            device: self.identity.device_id,
        }
    }

    pub fn username(&self) -> &Username {
        &self.identity.username
    }

    /// This device's public bundle, for enrollment by the master device.
    pub fn device_bundle(&self) -> DeviceBundle {
        self.identity.bundle()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessengerEvent> {
        self.events.subscribe()
    }

    // ── Device enrollment ────────────────────────────────────────────────

    /// Sign a sibling device's bundle with the master key and republish the
    /// user config. Master-only; idempotent per device id.
    pub async fn enroll_device(&self, bundle: DeviceBundle) -> Result<(), MessengerError> {
        if !self.identity.is_master {
            return Err(MessengerError::Forbidden(
                "only the master device enrolls new devices".into(),
            ));
        }
        let mut config = match self.transport.read_key_bundle(&self.identity.username).await {
            Ok(existing) if existing.master_signing_pub == self.identity.signing.public() => {
                existing
            }
            _ => build_user_config(&self.identity, &[])?,
        };
        let address = DeviceAddress {
            user: self.identity.username.clone(),
            device: bundle.device_id,
        };
        let signed = Signed::sign(bundle, &self.identity.signing)?;
        config.add_device_bundle(signed)?;
        self.transport.publish_key_bundle(&config).await?;
        // Our own cached copy must reflect the new device immediately.
        self.sessions.peer_config(&self.identity.username, true).await?;
        self.events
            .emit(MessengerEvent::DeviceRegistered { address });
        Ok(())
    }

    /// Drop a sibling device from the published config (master-only).
    pub async fn revoke_device(
        &self,
        device: cypher_crypto::identity::DeviceId,
    ) -> Result<(), MessengerError> {
        if !self.identity.is_master {
            return Err(MessengerError::Forbidden(
                "only the master device revokes devices".into(),
            ));
        }
        let mut config = self
            .transport
            .read_key_bundle(&self.identity.username)
            .await?;
        config.remove_device_bundle(&self.identity.signing, device)?;
        self.transport.publish_key_bundle(&config).await?;
        self.sessions.peer_config(&self.identity.username, true).await?;
        self.sessions
            .rekey(&DeviceAddress {
                user: self.identity.username.clone(),
                device,
            })
            .await?;
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────────────

    /// Open a one-to-one conversation. Chatting with yourself is the
    /// `CurrentUser` target, not a private chat.
    pub async fn create_private_chat(&self, peer: &str) -> Result<ChatRecord, MessengerError> {
        let peer = Username::new(peer);
        if peer == self.identity.username {
            return Err(MessengerError::Forbidden(
                "a private chat with yourself is not allowed".into(),
            ));
        }
        // Resolving the peer's config both proves the user exists and pins
        // their identity as a contact.
        self.sessions.peer_config(&peer, false).await?;
        let key = ConversationKey::Private(peer);
        self.router.ensure_conversation(&key).await?;
        self.router
            .conversation(&key)
            .await?
            .ok_or_else(|| MessengerError::InternalInvariant("conversation vanished".into()))
    }

    pub async fn get_private_chat(
        &self,
        peer: &str,
    ) -> Result<Option<ChatRecord>, MessengerError> {
        self.router
            .conversation(&ConversationKey::Private(Username::new(peer)))
            .await
    }

    /// Create a group with the local user as admin and announce it to every
    /// member.
    pub async fn create_group_chat(
        &self,
        members: &[&str],
    ) -> Result<GroupConfig, MessengerError> {
        let members: BTreeSet<Username> = members.iter().map(|m| Username::new(m)).collect();
        let signed = self.groups.create(members).await?;
        let config = signed.payload.clone();
        self.router
            .ensure_conversation(&ConversationKey::Group(config.id.clone()))
            .await?;
        self.broadcast_group_config(signed).await?;
        Ok(config)
    }

    /// The group as this device currently trusts it; `None` when unknown
    /// or when the local user is not a member.
    pub async fn get_group_chat(
        &self,
        id: &GroupId,
    ) -> Result<Option<GroupConfig>, MessengerError> {
        Ok(self
            .groups
            .get(id)
            .await?
            .filter(|config| config.is_member(&self.identity.username)))
    }

    /// Sign and distribute a mutated group config (membership change,
    /// promotion, metadata edit). Authority is checked against the
    /// currently trusted config.
    pub async fn publish_group_update(
        &self,
        config: GroupConfig,
    ) -> Result<(), MessengerError> {
        let signed = Signed::sign(config, &self.identity.signing)?;
        let adopted = self
            .groups
            .apply_update(
                &self.identity.username,
                &[self.identity.signing.public()],
                signed.clone(),
            )
            .await?;
        if !adopted {
            return Err(MessengerError::Forbidden(
                "update is older than the current group config".into(),
            ));
        }
        self.broadcast_group_config(signed).await?;
        Ok(())
    }

    async fn broadcast_group_config(
        &self,
        signed: Signed<GroupConfig>,
    ) -> Result<(), MessengerError> {
        let group_id = signed.payload.id.clone();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "config".to_string(),
            serde_json::to_value(&signed)
                .map_err(|e| MessengerError::InternalInvariant(e.to_string()))?,
        );
        let message = SingleCypherMessage::magic(
            MessageTarget::GroupChat(group_id),
            magic::GROUP_UPDATE,
            metadata,
            self.next_order().await?,
        );
        self.router.send(message, None).await
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Build and fan out a text message. Returns the message as sent
    /// (carrying its remote id and order).
    pub async fn send_text(
        &self,
        target: MessageTarget,
        body: &str,
    ) -> Result<SingleCypherMessage, MessengerError> {
        let message = SingleCypherMessage::text(target, body, self.next_order().await?);
        self.router.send(message.clone(), None).await?;
        Ok(message)
    }

    /// Fan out an arbitrary prepared message.
    pub async fn send_message(
        &self,
        message: SingleCypherMessage,
        cancel: Option<CancelToken>,
    ) -> Result<(), MessengerError> {
        self.router.send(message, cancel).await
    }

    /// A conversation's log in send order.
    pub async fn messages(
        &self,
        conversation: &ConversationKey,
    ) -> Result<Vec<StoredMessage>, MessengerError> {
        self.router.messages(conversation).await
    }

    // ── P2P ──────────────────────────────────────────────────────────────

    /// Dial a peer device over a caller-supplied connection.
    pub async fn open_p2p_with(
        &self,
        peer: DeviceAddress,
        conn: Box<dyn P2pConnection>,
    ) -> Result<Arc<P2pChannel>, MessengerError> {
        self.p2p.open_with(peer, conn).await
    }

    /// Answer a peer device over a caller-supplied connection.
    pub async fn accept_p2p_with(
        &self,
        peer: DeviceAddress,
        conn: Box<dyn P2pConnection>,
    ) -> Result<Arc<P2pChannel>, MessengerError> {
        self.p2p.accept_with(peer, conn).await
    }

    /// Advertise rendezvous metadata to a peer (a `p2p.offer` magic
    /// message); the peer's factory dials us back.
    pub async fn send_p2p_offer(
        &self,
        peer: &Username,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<(), MessengerError> {
        let message = SingleCypherMessage::magic(
            MessageTarget::PrivateChat(peer.clone()),
            magic::P2P_OFFER,
            metadata,
            self.next_order().await?,
        );
        self.router.send(message, None).await
    }

    pub async fn p2p_channel(&self, peer: &DeviceAddress) -> Option<Arc<P2pChannel>> {
        self.p2p.channel(peer).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Re-wrap the at-rest master key under a new app password.
    pub async fn change_password(
        &self,
        old_password: &[u8],
        new_password: &[u8],
    ) -> Result<(), MessengerError> {
        self.store.change_password(old_password, new_password).await
    }

    /// Tear down the session with one peer device; the next outbound
    /// message re-establishes it.
    pub async fn rekey(&self, address: &DeviceAddress) -> Result<(), MessengerError> {
        self.sessions.rekey(address).await
    }

    /// Orderly shutdown: close P2P channels and stop the intake loop.
    pub async fn shutdown(&self) {
        self.p2p.close_all().await;
        self.intake.abort();
        self.store.lock().await;
    }

    async fn next_order(&self) -> Result<u64, MessengerError> {
        let mut order = self.order.lock().await;
        *order += 1;
        self.store
            .put_record(Namespace::CustomConfig, ORDER_COUNTER_ID, &*order)
            .await?;
        Ok(*order)
    }
}

impl Drop for CypherMessenger {
    fn drop(&mut self) {
        self.intake.abort();
    }
}
