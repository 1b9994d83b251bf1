//! cypher_proto — Wire types, envelopes, and serialisation for Cypher Messenger
//!
//! Everything on the wire is MessagePack in named-field mode, versioned at
//! the envelope so the format can evolve without flag days.
//!
//! # Modules
//! - `envelope` — Encrypted per-device envelope (what the transport sees)
//! - `message`  — Plaintext message types (inside the sealed envelope)
//! - `group`    — Signed group configuration + conflict resolution
//! - `codec`    — Deterministic encoding, padding, and framing
//! - `error`    — unified error type

pub mod codec;
pub mod envelope;
pub mod error;
pub mod group;
pub mod message;

pub use codec::PaddingMode;
pub use envelope::{DeviceAddress, Encrypted, Envelope, PushType};
pub use error::CodecError;
pub use group::{GroupConfig, GroupId};
pub use message::{CypherMessage, MessageTarget, MessageType, SingleCypherMessage};
