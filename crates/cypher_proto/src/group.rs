//! Signed group configuration.
//!
//! A group is described entirely by its latest valid `GroupConfig`, signed
//! by the admin (or, for metadata-only edits, a moderator) and distributed
//! as a magic message. There is no shared group secret: fan-out is pairwise
//! over every (member, device), so each peer keeps its own forward secrecy.
//!
//! Conflict resolution is last-writer-wins by
//! (signer privilege, created_at, signature bytes) — deterministic on every
//! device regardless of delivery order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cypher_crypto::identity::Username;

use crate::error::CodecError;

/// Opaque group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authority level a signer holds over a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPrivilege {
    Moderator,
    Admin,
}

/// The authoritative descriptor of a group at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(rename = "i")]
    pub id: GroupId,
    #[serde(rename = "a")]
    pub admin: Username,
    #[serde(rename = "m")]
    pub members: BTreeSet<Username>,
    /// Moderators must be members.
    #[serde(rename = "o")]
    pub moderators: BTreeSet<Username>,
    /// Kicked users; inbound messages from them dated after this config are
    /// dropped.
    #[serde(rename = "k")]
    pub kicked: BTreeSet<Username>,
    #[serde(rename = "md")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Monotonic per group: every accepted update carries a later timestamp
    /// (ties broken by signature bytes).
    #[serde(rename = "c")]
    pub created_at: DateTime<Utc>,
}

impl GroupConfig {
    pub fn new(admin: Username, members: BTreeSet<Username>) -> Self {
        let mut members = members;
        members.insert(admin.clone());
        Self {
            id: GroupId::generate(),
            admin,
            members,
            moderators: BTreeSet::new(),
            kicked: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Structural invariants: admin is a member, moderators are members,
    /// kicked users are not members.
    pub fn validate(&self) -> Result<(), CodecError> {
        if !self.members.contains(&self.admin) {
            return Err(CodecError::Decode("group admin must be a member".into()));
        }
        if !self.moderators.is_subset(&self.members) {
            return Err(CodecError::Decode("moderators must be members".into()));
        }
        if self.kicked.iter().any(|u| self.members.contains(u)) {
            return Err(CodecError::Decode("kicked users cannot be members".into()));
        }
        Ok(())
    }

    pub fn is_member(&self, user: &Username) -> bool {
        self.members.contains(user)
    }

    pub fn privilege_of(&self, user: &Username) -> Option<GroupPrivilege> {
        if user == &self.admin {
            Some(GroupPrivilege::Admin)
        } else if self.moderators.contains(user) {
            Some(GroupPrivilege::Moderator)
        } else {
            None
        }
    }

    /// True when `other` describes the same membership state (members,
    /// moderators, kicked, admin). Moderators may only push updates for
    /// which this holds.
    pub fn membership_equals(&self, other: &GroupConfig) -> bool {
        self.admin == other.admin
            && self.members == other.members
            && self.moderators == other.moderators
            && self.kicked == other.kicked
    }
}

/// Last-writer-wins ordering between two accepted updates of the same group.
///
/// `created_at` is the monotonic component and decides first; on a timestamp
/// tie the higher privilege wins, and a full tie falls back to signature
/// bytes so every device picks the same winner.
///
/// Returns true when the candidate supersedes the incumbent.
pub fn update_supersedes(
    candidate: (GroupPrivilege, DateTime<Utc>, &[u8]),
    incumbent: (GroupPrivilege, DateTime<Utc>, &[u8]),
) -> bool {
    let (cand_priv, cand_at, cand_sig) = candidate;
    let (inc_priv, inc_at, inc_sig) = incumbent;
    (cand_at, cand_priv, cand_sig) > (inc_at, inc_priv, inc_sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_group() -> GroupConfig {
        let members: BTreeSet<_> = ["m0", "m1", "m2"].iter().map(|u| Username::new(u)).collect();
        GroupConfig::new(Username::new("m0"), members)
    }

    #[test]
    fn admin_is_always_a_member() {
        let group = GroupConfig::new(Username::new("m0"), BTreeSet::new());
        assert!(group.is_member(&Username::new("m0")));
        group.validate().unwrap();
    }

    #[test]
    fn moderator_outside_members_is_invalid() {
        let mut group = base_group();
        group.moderators.insert(Username::new("stranger"));
        assert!(group.validate().is_err());
    }

    #[test]
    fn kicked_member_overlap_is_invalid() {
        let mut group = base_group();
        group.kicked.insert(Username::new("m1"));
        assert!(group.validate().is_err());
    }

    #[test]
    fn privilege_ranks_admin_over_moderator() {
        let mut group = base_group();
        group.moderators.insert(Username::new("m1"));
        assert_eq!(group.privilege_of(&Username::new("m0")), Some(GroupPrivilege::Admin));
        assert_eq!(
            group.privilege_of(&Username::new("m1")),
            Some(GroupPrivilege::Moderator)
        );
        assert_eq!(group.privilege_of(&Username::new("m2")), None);
        assert!(GroupPrivilege::Admin > GroupPrivilege::Moderator);
    }

    #[test]
    fn lww_prefers_time_then_privilege_then_signature() {
        let now = Utc::now();
        let later = now + Duration::seconds(5);

        // Later always wins, regardless of privilege
        assert!(update_supersedes(
            (GroupPrivilege::Moderator, later, b"aa"),
            (GroupPrivilege::Admin, now, b"zz"),
        ));
        assert!(!update_supersedes(
            (GroupPrivilege::Moderator, now, b"zz"),
            (GroupPrivilege::Admin, later, b"aa"),
        ));
        // Timestamp tie: admin beats moderator
        assert!(update_supersedes(
            (GroupPrivilege::Admin, now, b"aa"),
            (GroupPrivilege::Moderator, now, b"zz"),
        ));
        // Full tie on time and privilege: signature bytes decide
        assert!(update_supersedes(
            (GroupPrivilege::Admin, now, b"zz"),
            (GroupPrivilege::Admin, now, b"aa"),
        ));
        assert!(!update_supersedes(
            (GroupPrivilege::Admin, now, b"aa"),
            (GroupPrivilege::Admin, now, b"zz"),
        ));
    }
}
