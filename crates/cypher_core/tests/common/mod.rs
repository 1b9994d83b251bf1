//! Test doubles: an in-memory transport hub, a duplex P2P pipe, and sync
//! helpers for event-driven assertions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use cypher_core::{
    memory::MemoryStorage, Collaborators, CypherMessenger, DefaultHooks, InboundEnvelope,
    MessengerConfig, MessengerError, P2pChannel, P2pConnection, PeerStatus, Transport,
};
use cypher_crypto::identity::{generate_device_identity, DeviceIdentity, UserConfig, Username};
use cypher_proto::{DeviceAddress, GroupConfig, GroupId, PushType};

// ── Transport hub ────────────────────────────────────────────────────────────

/// A loopback "server": key bundles by user, one inbox per device, optional
/// per-device holds for reordering tests and duplication for dedup tests.
#[derive(Default)]
pub struct Hub {
    bundles: Mutex<HashMap<Username, UserConfig>>,
    inboxes: Mutex<HashMap<DeviceAddress, mpsc::Sender<InboundEnvelope>>>,
    queued: Mutex<HashMap<DeviceAddress, Vec<InboundEnvelope>>>,
    held: Mutex<HashMap<DeviceAddress, Vec<InboundEnvelope>>>,
    paused: Mutex<HashSet<DeviceAddress>>,
    duplicating: Mutex<HashSet<DeviceAddress>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold deliveries to `to` until `release_held` picks them.
    pub async fn pause(&self, to: &DeviceAddress) {
        self.paused.lock().await.insert(to.clone());
    }

    /// Deliver held envelopes in the given positional order, then resume
    /// live delivery.
    pub async fn release_held(&self, to: &DeviceAddress, order: &[usize]) {
        self.paused.lock().await.remove(to);
        let mut held: Vec<Option<InboundEnvelope>> = self
            .held
            .lock()
            .await
            .remove(to)
            .unwrap_or_default()
            .into_iter()
            .map(Some)
            .collect();
        for &index in order {
            if let Some(envelope) = held.get_mut(index).and_then(Option::take) {
                self.deliver_now(to, envelope).await;
            }
        }
        for envelope in held.into_iter().flatten() {
            self.deliver_now(to, envelope).await;
        }
    }

    /// Deliver every envelope to `to` twice (redelivery simulation).
    pub async fn duplicate_deliveries(&self, to: &DeviceAddress) {
        self.duplicating.lock().await.insert(to.clone());
    }

    async fn deliver_now(&self, to: &DeviceAddress, envelope: InboundEnvelope) {
        let inbox = self.inboxes.lock().await.get(to).cloned();
        match inbox {
            Some(tx) => {
                let _ = tx.send(envelope).await;
            }
            None => {
                self.queued
                    .lock()
                    .await
                    .entry(to.clone())
                    .or_default()
                    .push(envelope);
            }
        }
    }

    async fn deliver(&self, to: &DeviceAddress, envelope: InboundEnvelope) {
        if self.paused.lock().await.contains(to) {
            self.held
                .lock()
                .await
                .entry(to.clone())
                .or_default()
                .push(envelope);
            return;
        }
        if self.duplicating.lock().await.contains(to) {
            let copy = InboundEnvelope {
                sender: envelope.sender.clone(),
                bytes: envelope.bytes.clone(),
            };
            self.deliver_now(to, copy).await;
        }
        self.deliver_now(to, envelope).await;
    }
}

pub struct HubTransport {
    hub: Arc<Hub>,
    local: DeviceAddress,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send_message(
        &self,
        to: &DeviceAddress,
        envelope: Vec<u8>,
        _push: PushType,
    ) -> Result<(), MessengerError> {
        self.hub
            .deliver(
                to,
                InboundEnvelope {
                    sender: self.local.clone(),
                    bytes: envelope,
                },
            )
            .await;
        Ok(())
    }

    async fn read_key_bundle(&self, user: &Username) -> Result<UserConfig, MessengerError> {
        self.hub
            .bundles
            .lock()
            .await
            .get(user)
            .cloned()
            .ok_or_else(|| MessengerError::TransportUnavailable(format!("no bundle for {user}")))
    }

    async fn publish_key_bundle(&self, config: &UserConfig) -> Result<(), MessengerError> {
        self.hub
            .bundles
            .lock()
            .await
            .insert(self.local.user.clone(), config.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<InboundEnvelope>, MessengerError> {
        let (tx, rx) = mpsc::channel(256);
        let backlog = self
            .hub
            .queued
            .lock()
            .await
            .remove(&self.local)
            .unwrap_or_default();
        for envelope in backlog {
            let _ = tx.send(envelope).await;
        }
        self.hub.inboxes.lock().await.insert(self.local.clone(), tx);
        Ok(rx)
    }
}

// ── Messenger construction ───────────────────────────────────────────────────

/// Short-fuse config so failure paths don't stall the suite.
pub fn test_config() -> MessengerConfig {
    MessengerConfig {
        user_config_fetch_timeout: Duration::from_secs(2),
        transport_send_timeout: Duration::from_secs(2),
        p2p_handshake_timeout: Duration::from_secs(2),
        p2p_send_timeout: Duration::from_millis(400),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        ..MessengerConfig::default()
    }
}

pub struct TestDevice {
    pub messenger: CypherMessenger,
    pub address: DeviceAddress,
}

/// Register a device on the hub. `master` decides whether it anchors the
/// user's trust graph or waits to be enrolled.
pub async fn spawn_device(hub: &Arc<Hub>, user: &str, master: bool) -> TestDevice {
    let identity = generate_device_identity(Username::new(user), master);
    spawn_with_identity(hub, identity).await
}

pub async fn spawn_with_identity(hub: &Arc<Hub>, identity: DeviceIdentity) -> TestDevice {
    let address = DeviceAddress {
        user: identity.username.clone(),
        device: identity.device_id,
    };
    let transport = Arc::new(HubTransport {
        hub: hub.clone(),
        local: address.clone(),
    });
    let messenger = CypherMessenger::register(
        identity,
        b"test-password",
        Collaborators {
            storage: Arc::new(MemoryStorage::new()),
            transport,
            hooks: Arc::new(DefaultHooks),
            p2p_factory: None,
        },
        test_config(),
    )
    .await
    .expect("register messenger");
    TestDevice { messenger, address }
}

// ── Sync helpers ─────────────────────────────────────────────────────────────

/// Poll until the conversation log reaches `len` entries.
pub async fn wait_for_log_len(
    messenger: &CypherMessenger,
    conversation: &cypher_core::ConversationKey,
    len: usize,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let log = messenger.messages(conversation).await.expect("read log");
            if log.len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("log never reached {len} entries"));
}

/// Poll until the messenger trusts a group config matching `pred`.
pub async fn wait_for_group<F>(messenger: &CypherMessenger, id: &GroupId, pred: F)
where
    F: Fn(&GroupConfig) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let config = messenger.get_group_chat(id).await.expect("read group");
            if config.as_ref().is_some_and(&pred) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("group {id} never reached the expected state"));
}

/// Poll until a P2P channel has observed a remote status matching `pred`.
pub async fn wait_for_status<F>(channel: &P2pChannel, pred: F)
where
    F: Fn(&PeerStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if channel.remote_status().await.as_ref().is_some_and(&pred) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer status never matched");
}

// ── Duplex P2P pipe ──────────────────────────────────────────────────────────

pub struct DuplexConn {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Two connected in-memory byte pipes, one per side.
pub fn duplex_pair() -> (Box<dyn P2pConnection>, Box<dyn P2pConnection>) {
    let (a_tx, b_rx) = mpsc::channel(64);
    let (b_tx, a_rx) = mpsc::channel(64);
    (
        Box::new(DuplexConn {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        }),
        Box::new(DuplexConn {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        }),
    )
}

#[async_trait]
impl P2pConnection for DuplexConn {
    async fn send(&self, frame: Vec<u8>) -> Result<(), MessengerError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| MessengerError::TransportUnavailable("p2p pipe closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, MessengerError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        self.rx.lock().await.close();
    }
}
