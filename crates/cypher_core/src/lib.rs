//! cypher_core — the messenger core
//!
//! The cryptographic session layer plus the multi-device fan-out protocol:
//! per-(user, device) ratcheted sessions, envelope routing with dedup and
//! ordering, signed group state, a direct P2P channel, and an ordered event
//! bus — everything between the application's UI/storage and its network
//! transport.
//!
//! # Module layout
//! - `messenger` — the `CypherMessenger` facade owning all subsystems
//! - `sessions`  — (peer, device) → ratchet session map + X3DH bootstrap
//! - `router`    — outbound fan-out, inbound dispatch, conversation logs
//! - `groups`    — signed group config materialization
//! - `p2p`       — direct channel: handshake, sealed frames, ack fallback
//! - `events`    — ordered broadcast bus toward the host application
//! - `store`     — encrypted at-rest layer over the storage collaborator
//! - `traits`    — collaborator seams (storage, transport, hooks, P2P)
//! - `memory`    — reference in-memory storage adapter
//! - `config`    — timeouts and protocol caps
//! - `error`     — unified error type

pub mod config;
pub mod error;
pub mod events;
pub mod groups;
pub mod memory;
pub mod messenger;
pub mod p2p;
pub mod router;
pub mod sessions;
pub mod store;
pub mod traits;

pub use config::MessengerConfig;
pub use error::MessengerError;
pub use events::{EventBus, MessengerEvent};
pub use messenger::{Collaborators, CypherMessenger};
pub use p2p::{P2pChannel, P2pManager, PeerStatus};
pub use router::{ChatRecord, ConversationKey, Router, StoredMessage};
pub use sessions::SessionManager;
pub use store::EncryptedStore;
pub use traits::{
    CancelToken, DefaultHooks, InboundEnvelope, MessageHooks, Namespace, P2pConnection,
    P2pTransportFactory, ReceiveDisposition, SendDisposition, StorageAdapter, Transport,
};
