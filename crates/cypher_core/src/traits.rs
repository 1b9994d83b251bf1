//! Collaborator capability traits.
//!
//! The core owns the protocol; everything with an outside — persistence,
//! the server transport, application hooks, P2P sockets — arrives through
//! one of these seams. All of them are object-safe async traits so the
//! embedder can hand in whatever it has.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use cypher_crypto::identity::{UserConfig, Username};
use cypher_proto::{DeviceAddress, PushType, SingleCypherMessage};

use crate::error::MessengerError;

// ── Storage ──────────────────────────────────────────────────────────────────

/// Storage namespaces. The core never needs multi-key transactions; the
/// adapter must offer linearizable single-key operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Devices,
    Sessions,
    Messages,
    Conversations,
    Contacts,
    Groups,
    CustomConfig,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Devices => "devices",
            Namespace::Sessions => "sessions",
            Namespace::Messages => "messages",
            Namespace::Conversations => "conversations",
            Namespace::Contacts => "contacts",
            Namespace::Groups => "groups",
            Namespace::CustomConfig => "custom_config",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pluggable key-value store. Values are always ciphertext by the time they
/// reach the adapter — see `EncryptedStore`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, ns: Namespace, id: &str) -> Result<Option<Vec<u8>>, MessengerError>;
    async fn put(&self, ns: Namespace, id: &str, bytes: Vec<u8>) -> Result<(), MessengerError>;
    async fn delete(&self, ns: Namespace, id: &str) -> Result<(), MessengerError>;
    async fn list(&self, ns: Namespace) -> Result<Vec<String>, MessengerError>;
}

// ── Transport ────────────────────────────────────────────────────────────────

/// An envelope handed up by the transport, tagged with the authenticated
/// sender address.
#[derive(Debug)]
pub struct InboundEnvelope {
    pub sender: DeviceAddress,
    pub bytes: Vec<u8>,
}

/// Server transport client. Envelope bytes are idempotent by
/// (sender, remote_id): redelivery is harmless.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        to: &DeviceAddress,
        envelope: Vec<u8>,
        push: PushType,
    ) -> Result<(), MessengerError>;

    async fn read_key_bundle(&self, user: &Username) -> Result<UserConfig, MessengerError>;

    async fn publish_key_bundle(&self, config: &UserConfig) -> Result<(), MessengerError>;

    /// Stream of incoming envelopes for the local device.
    async fn subscribe(&self) -> Result<mpsc::Receiver<InboundEnvelope>, MessengerError>;
}

// ── Application hooks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Dispatch without persisting locally.
    Send,
    /// Persist under the message's remote id, then dispatch.
    SaveAndSend,
    /// Swallow the message.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDisposition {
    Save,
    Ignore,
}

/// Host application hooks. The router never re-enters a hook for the same
/// message; hooks may suspend.
#[async_trait]
pub trait MessageHooks: Send + Sync {
    async fn on_send_message(&self, _message: &SingleCypherMessage) -> SendDisposition {
        SendDisposition::SaveAndSend
    }

    async fn on_receive_message(&self, _message: &SingleCypherMessage) -> ReceiveDisposition {
        ReceiveDisposition::Save
    }
}

/// Hook implementation with the default dispositions.
pub struct DefaultHooks;

#[async_trait]
impl MessageHooks for DefaultHooks {}

// ── P2P factory ──────────────────────────────────────────────────────────────

/// A raw, ordered, reliable byte-frame pipe between two devices. The channel
/// layer on top does its own authentication and encryption, so a factory
/// only has to move bytes.
#[async_trait]
pub trait P2pConnection: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), MessengerError>;
    /// `None` means the peer closed the connection.
    async fn recv(&self) -> Result<Option<Vec<u8>>, MessengerError>;
    async fn close(&self);
}

/// Capability for establishing direct connections. `metadata` is the opaque
/// rendezvous document exchanged through `p2p.offer` magic messages.
#[async_trait]
pub trait P2pTransportFactory: Send + Sync {
    fn transport_layer_identifier(&self) -> &'static str;

    async fn create_outbound(
        &self,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Box<dyn P2pConnection>, MessengerError>;

    async fn create_inbound(
        &self,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Box<dyn P2pConnection>, MessengerError>;
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation handle for long-running operations.
///
/// Cancelling before any envelope reaches the transport yields `Cancelled`
/// with no state change; cancelling after partial dispatch yields
/// `PartiallySent` and the delivered envelopes stay delivered.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
