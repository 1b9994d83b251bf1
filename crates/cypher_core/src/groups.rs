//! Group state materialization.
//!
//! A group exists locally as the last admin/moderator-signed `GroupConfig`
//! this device has validated. Updates arrive as `group.update` magic
//! messages; conflicts resolve last-writer-wins by
//! (signer privilege, created_at, signature bytes), so every device
//! converges on the same config without coordination.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use cypher_crypto::identity::{DeviceIdentity, PublicSigningKey, Signed, Username};
use cypher_proto::{
    group::{update_supersedes, GroupPrivilege},
    GroupConfig, GroupId,
};

use crate::{
    error::MessengerError,
    events::{EventBus, MessengerEvent},
    router::ConversationKey,
    store::EncryptedStore,
    traits::Namespace,
};

/// Persisted group state: the accepted signed config plus who signed it and
/// with what authority (needed for later conflict resolution).
#[derive(Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub signed: Signed<GroupConfig>,
    pub signer: Username,
    pub privilege: GroupPrivilege,
}

pub struct GroupManager {
    identity: Arc<DeviceIdentity>,
    store: EncryptedStore,
    events: EventBus,
    cache: Mutex<HashMap<GroupId, GroupRecord>>,
}

impl GroupManager {
    pub fn new(identity: Arc<DeviceIdentity>, store: EncryptedStore, events: EventBus) -> Self {
        Self {
            identity,
            store,
            events,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn record(&self, id: &GroupId) -> Result<Option<GroupRecord>, MessengerError> {
        {
            let cache = self.cache.lock().await;
            if let Some(record) = cache.get(id) {
                return Ok(Some(record.clone()));
            }
        }
        let persisted: Option<GroupRecord> =
            self.store.get_record(Namespace::Groups, id.as_str()).await?;
        if let Some(record) = persisted.clone() {
            self.cache.lock().await.insert(id.clone(), record);
        }
        Ok(persisted)
    }

    async fn commit(&self, record: GroupRecord) -> Result<(), MessengerError> {
        let id = record.signed.payload.id.clone();
        self.store
            .put_record(Namespace::Groups, id.as_str(), &record)
            .await?;
        self.cache.lock().await.insert(id, record);
        Ok(())
    }

    /// Create a group administered by the local user and signed by this
    /// device.
    pub async fn create(
        &self,
        members: BTreeSet<Username>,
    ) -> Result<Signed<GroupConfig>, MessengerError> {
        let config = GroupConfig::new(self.identity.username.clone(), members);
        config.validate()?;
        let signed = Signed::sign(config, &self.identity.signing)?;
        let record = GroupRecord {
            signed: signed.clone(),
            signer: self.identity.username.clone(),
            privilege: GroupPrivilege::Admin,
        };
        self.commit(record).await?;
        Ok(signed)
    }

    pub async fn get(&self, id: &GroupId) -> Result<Option<GroupConfig>, MessengerError> {
        Ok(self.record(id).await?.map(|r| r.signed.payload))
    }

    /// Apply an inbound signed config. `sender_keys` are the signing keys
    /// of the sender's *validated* devices — the signature must come from
    /// one of them.
    ///
    /// Returns true when the update was adopted, false when it lost the
    /// last-writer-wins comparison.
    pub async fn apply_update(
        &self,
        sender: &Username,
        sender_keys: &[PublicSigningKey],
        signed: Signed<GroupConfig>,
    ) -> Result<bool, MessengerError> {
        if !sender_keys.contains(&signed.signer_pub) {
            return Err(MessengerError::InvalidSignature);
        }
        signed.verify()?;
        signed.payload.validate()?;

        let candidate = &signed.payload;
        let current = self.record(&candidate.id).await?;

        let privilege = match &current {
            // A previously unknown group must arrive from its admin, and
            // only lands on devices that are actually members.
            None => {
                if sender != &candidate.admin {
                    return Err(MessengerError::Forbidden(
                        "group creation requires the admin's signature".into(),
                    ));
                }
                if !candidate.is_member(&self.identity.username) {
                    return Err(MessengerError::NotAMember);
                }
                GroupPrivilege::Admin
            }
            // Authority is judged against the config we currently trust,
            // not the candidate's self-description.
            Some(record) => {
                let trusted = &record.signed.payload;
                let privilege = trusted
                    .privilege_of(sender)
                    .ok_or_else(|| MessengerError::Forbidden("signer holds no group authority".into()))?;
                if privilege == GroupPrivilege::Moderator
                    && !trusted.membership_equals(candidate)
                {
                    return Err(MessengerError::Forbidden(
                        "moderators may only edit non-membership metadata".into(),
                    ));
                }
                privilege
            }
        };

        if let Some(record) = &current {
            let wins = update_supersedes(
                (privilege, candidate.created_at, &signed.signature),
                (
                    record.privilege,
                    record.signed.payload.created_at,
                    &record.signed.signature,
                ),
            );
            if !wins {
                tracing::debug!(
                    target: "cypher_core",
                    event = "group_update_stale",
                    group = %candidate.id,
                    sender = %sender,
                );
                return Ok(false);
            }
        }

        let id = candidate.id.clone();
        self.commit(GroupRecord {
            signed,
            signer: sender.clone(),
            privilege,
        })
        .await?;
        self.events.emit(MessengerEvent::ConversationUpdated {
            conversation: ConversationKey::Group(id),
        });
        Ok(true)
    }

    /// Members to fan out to for a group send. The local user must be a
    /// current, un-kicked member.
    pub async fn members_for_send(&self, id: &GroupId) -> Result<Vec<Username>, MessengerError> {
        let config = self
            .get(id)
            .await?
            .ok_or(MessengerError::NotAMember)?;
        if config.kicked.contains(&self.identity.username) {
            return Err(MessengerError::Kicked);
        }
        if !config.is_member(&self.identity.username) {
            return Err(MessengerError::NotAMember);
        }
        Ok(config.members.iter().cloned().collect())
    }

    /// If `user` is kicked from the group, the timestamp of the config that
    /// kicked them; inbound messages dated after it are dropped.
    pub async fn kicked_since(
        &self,
        id: &GroupId,
        user: &Username,
    ) -> Result<Option<DateTime<Utc>>, MessengerError> {
        Ok(self.get(id).await?.and_then(|config| {
            config
                .kicked
                .contains(user)
                .then_some(config.created_at)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use cypher_crypto::identity::{generate_device_identity, SigningKeyPair};

    async fn manager(user: &str) -> (GroupManager, Arc<DeviceIdentity>) {
        let identity = Arc::new(generate_device_identity(Username::new(user), true));
        let store = EncryptedStore::new(Arc::new(MemoryStorage::new()));
        store.unlock(b"pw").await.unwrap();
        (
            GroupManager::new(identity.clone(), store, EventBus::new(16)),
            identity,
        )
    }

    fn members(users: &[&str]) -> BTreeSet<Username> {
        users.iter().map(|u| Username::new(u)).collect()
    }

    #[tokio::test]
    async fn admin_creates_and_members_resolve() {
        let (groups, _) = manager("m0").await;
        let signed = groups.create(members(&["m1", "m2"])).await.unwrap();
        let id = signed.payload.id.clone();

        let listed = groups.members_for_send(&id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.contains(&Username::new("m0")));
    }

    #[tokio::test]
    async fn unknown_group_requires_admin_signature() {
        let (m0_groups, m0) = manager("m0").await;
        let (m1_groups, m1) = manager("m1").await;
        let signed = m0_groups.create(members(&["m1"])).await.unwrap();

        // m1 accepts the admin-signed config...
        assert!(m1_groups
            .apply_update(&Username::new("m0"), &[m0.signing.public()], signed.clone())
            .await
            .unwrap());

        // ...but a config "created" by a non-admin is rejected.
        let forged = Signed::sign(signed.payload.clone(), &m1.signing).unwrap();
        let (m2_groups, _) = manager("m1").await;
        let err = m2_groups
            .apply_update(&Username::new("m1"), &[m1.signing.public()], forged)
            .await;
        assert!(matches!(err, Err(MessengerError::Forbidden(_))));
    }

    #[tokio::test]
    async fn moderator_cannot_touch_membership() {
        let (m0_groups, m0) = manager("m0").await;
        let (m1_groups, m1) = manager("m1").await;

        let mut config = m0_groups.create(members(&["m1", "m2"])).await.unwrap().payload;
        config.moderators.insert(Username::new("m1"));
        config.created_at = Utc::now();
        let with_mod = Signed::sign(config.clone(), &m0.signing).unwrap();
        m1_groups
            .apply_update(&Username::new("m0"), &[m0.signing.public()], with_mod)
            .await
            .unwrap();

        // Metadata-only edit from the moderator: accepted.
        let mut meta_edit = config.clone();
        meta_edit.metadata.insert("topic".into(), serde_json::json!("rust"));
        meta_edit.created_at = Utc::now();
        let signed = Signed::sign(meta_edit, &m1.signing).unwrap();
        assert!(m1_groups
            .apply_update(&Username::new("m1"), &[m1.signing.public()], signed)
            .await
            .unwrap());

        // Membership change from the moderator: Forbidden.
        let mut kick = config.clone();
        kick.members.remove(&Username::new("m2"));
        kick.kicked.insert(Username::new("m2"));
        kick.created_at = Utc::now();
        let signed = Signed::sign(kick, &m1.signing).unwrap();
        let err = m1_groups
            .apply_update(&Username::new("m1"), &[m1.signing.public()], signed)
            .await;
        assert!(matches!(err, Err(MessengerError::Forbidden(_))));
    }

    #[tokio::test]
    async fn stale_update_loses_lww() {
        let (m0_groups, m0) = manager("m0").await;
        let (m1_groups, _) = manager("m1").await;

        let signed = m0_groups.create(members(&["m1"])).await.unwrap();
        let mut newer = signed.payload.clone();
        newer.created_at = Utc::now() + chrono::Duration::seconds(10);
        newer.metadata.insert("v".into(), serde_json::json!(2));
        let newer_signed = Signed::sign(newer, &m0.signing).unwrap();

        let m0_keys = [m0.signing.public()];
        let m0_name = Username::new("m0");
        assert!(m1_groups
            .apply_update(&m0_name, &m0_keys, newer_signed)
            .await
            .unwrap());
        // The older original now loses.
        assert!(!m1_groups
            .apply_update(&m0_name, &m0_keys, signed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn foreign_device_signature_is_rejected() {
        let (m1_groups, _) = manager("m1").await;
        let (m0_groups, m0) = manager("m0").await;
        let rogue = SigningKeyPair::generate();

        let signed = m0_groups.create(members(&["m1"])).await.unwrap();
        let reforged = Signed {
            payload: signed.payload,
            signer_pub: rogue.public(),
            signature: rogue.sign(b"whatever"),
        };
        let err = m1_groups
            .apply_update(&Username::new("m0"), &[m0.signing.public()], reforged)
            .await;
        assert!(matches!(err, Err(MessengerError::InvalidSignature)));
    }

    #[tokio::test]
    async fn kicked_since_reports_the_kicking_config() {
        let (m0_groups, m0) = manager("m0").await;
        let signed = m0_groups.create(members(&["m1", "m2"])).await.unwrap();
        let id = signed.payload.id.clone();

        let mut kick = signed.payload.clone();
        kick.members.remove(&Username::new("m2"));
        kick.kicked.insert(Username::new("m2"));
        kick.created_at = Utc::now() + chrono::Duration::seconds(1);
        let kick_signed = Signed::sign(kick.clone(), &m0.signing).unwrap();
        m0_groups
            .apply_update(&Username::new("m0"), &[m0.signing.public()], kick_signed)
            .await
            .unwrap();

        let since = m0_groups
            .kicked_since(&id, &Username::new("m2"))
            .await
            .unwrap();
        assert_eq!(since, Some(kick.created_at));
        assert!(m0_groups
            .kicked_since(&id, &Username::new("m1"))
            .await
            .unwrap()
            .is_none());
    }
}
