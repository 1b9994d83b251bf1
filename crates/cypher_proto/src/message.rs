//! Plaintext message types (inside the encrypted envelope).
//!
//! `SingleCypherMessage` is what applications exchange; `CypherMessage` is
//! the wire union that actually rides inside a sealed envelope. The union
//! pins the short keys `a` (type tag) and `b` (payload) so the frame layout
//! never shifts as variants are added.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cypher_crypto::identity::Username;

use crate::group::GroupId;

/// Message classes. `Magic` carries out-of-band control payloads (group
/// config changes, P2P offers) and usually never reaches UI history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Media,
    Magic,
}

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum MessageTarget {
    /// One-to-one conversation with a peer user.
    PrivateChat(Username),
    /// A group conversation.
    GroupChat(GroupId),
    /// The sender's own other devices.
    CurrentUser,
}

/// One application-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleCypherMessage {
    #[serde(rename = "t")]
    pub message_type: MessageType,
    /// Free-form refinement of the type, e.g. `"group.update"` for magic
    /// messages.
    #[serde(rename = "s", skip_serializing_if = "Option::is_none", default)]
    pub subtype: Option<String>,
    #[serde(rename = "x")]
    pub text: String,
    /// Opaque key-value document carried verbatim.
    #[serde(rename = "m")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Per-sender monotonically increasing sequence number.
    #[serde(rename = "o")]
    pub order: u64,
    /// Content-stable UUID shared by all copies of this message across
    /// sender and recipient devices; the dedup identity.
    #[serde(rename = "r")]
    pub remote_id: String,
    #[serde(rename = "d")]
    pub sent_date: DateTime<Utc>,
    #[serde(rename = "g")]
    pub target: MessageTarget,
    /// Reserved extension slot: optional fields from newer peers land here
    /// and survive re-serialization opaquely.
    #[serde(rename = "z", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SingleCypherMessage {
    pub fn text(target: MessageTarget, body: impl Into<String>, order: u64) -> Self {
        Self {
            message_type: MessageType::Text,
            subtype: None,
            text: body.into(),
            metadata: BTreeMap::new(),
            order,
            remote_id: uuid::Uuid::new_v4().to_string(),
            sent_date: Utc::now(),
            target,
            extra: BTreeMap::new(),
        }
    }

    pub fn magic(
        target: MessageTarget,
        subtype: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
        order: u64,
    ) -> Self {
        Self {
            message_type: MessageType::Magic,
            subtype: Some(subtype.into()),
            text: String::new(),
            metadata,
            order,
            remote_id: uuid::Uuid::new_v4().to_string(),
            sent_date: Utc::now(),
            target,
            extra: BTreeMap::new(),
        }
    }
}

/// The wire union: a single message or an ordered batch.
///
/// Batches are decoded for forward compatibility; this implementation only
/// ever *emits* singletons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a", content = "b")]
pub enum CypherMessage {
    #[serde(rename = "s")]
    Single(SingleCypherMessage),
    #[serde(rename = "b")]
    Batch(Vec<SingleCypherMessage>),
}

impl CypherMessage {
    /// The contained messages, batch order preserved.
    pub fn into_messages(self) -> Vec<SingleCypherMessage> {
        match self {
            CypherMessage::Single(msg) => vec![msg],
            CypherMessage::Batch(msgs) => msgs,
        }
    }
}

/// Well-known magic subtypes consumed by the core itself.
pub mod magic {
    /// Payload: a `Signed<GroupConfig>` in the `config` metadata key.
    pub const GROUP_UPDATE: &str = "group.update";
    /// Payload: P2P rendezvous metadata for the bundled factory.
    pub const P2P_OFFER: &str = "p2p.offer";
}
