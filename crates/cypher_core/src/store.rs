//! Encrypted at-rest layer over the storage collaborator.
//!
//! The adapter only ever sees ciphertext. A random 32-byte master key seals
//! every record; the master key itself is stored wrapped under an Argon2id
//! key derived from the app password. Changing the password re-wraps the
//! master key only — no record is touched.
//!
//! Unreadable ciphertext is surfaced as `Corrupted` and left in place for
//! inspection; the core never silently overwrites it.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroize;

use cypher_crypto::{aead, kdf};
use cypher_proto::codec;

use crate::{
    error::MessengerError,
    traits::{Namespace, StorageAdapter},
};

const SALT_ID: &str = "vault.salt";
const WRAPPED_MASTER_ID: &str = "vault.master";

/// Store handle. Cheap to clone; all clones share the unlocked master key.
#[derive(Clone)]
pub struct EncryptedStore {
    adapter: Arc<dyn StorageAdapter>,
    master: Arc<RwLock<Option<[u8; 32]>>>,
}

impl EncryptedStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            master: Arc::new(RwLock::new(None)),
        }
    }

    /// Unlock with the app password. First run generates the salt and the
    /// master key; later runs unwrap the stored master key. A wrong
    /// password fails as `Forbidden` without touching state.
    pub async fn unlock(&self, password: &[u8]) -> Result<(), MessengerError> {
        let salt = self.adapter.get(Namespace::CustomConfig, SALT_ID).await?;
        let master = match salt {
            Some(salt_bytes) => {
                let salt: [u8; 16] = salt_bytes
                    .try_into()
                    .map_err(|_| MessengerError::Corrupted("vault salt length".into()))?;
                let kek = kdf::master_key_from_password(password, &salt)?;
                let wrapped = self
                    .adapter
                    .get(Namespace::CustomConfig, WRAPPED_MASTER_ID)
                    .await?
                    .ok_or_else(|| MessengerError::Corrupted("missing wrapped master key".into()))?;
                aead::unwrap_key(&kek.0, &wrapped)
                    .map_err(|_| MessengerError::Forbidden("invalid app password".into()))?
            }
            None => {
                let salt = kdf::generate_salt();
                let kek = kdf::master_key_from_password(password, &salt)?;
                let mut master = [0u8; 32];
                rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut master);
                let wrapped = aead::wrap_key(&kek.0, &master)?;
                self.adapter
                    .put(Namespace::CustomConfig, SALT_ID, salt.to_vec())
                    .await?;
                self.adapter
                    .put(Namespace::CustomConfig, WRAPPED_MASTER_ID, wrapped)
                    .await?;
                master
            }
        };
        *self.master.write().await = Some(master);
        Ok(())
    }

    /// Lock the store — zeroizes the master key.
    pub async fn lock(&self) {
        let mut guard = self.master.write().await;
        if let Some(mut key) = guard.take() {
            key.zeroize();
        }
    }

    /// Re-wrap the master key under a key derived from `new_password`.
    /// Records are not re-encrypted.
    pub async fn change_password(
        &self,
        old_password: &[u8],
        new_password: &[u8],
    ) -> Result<(), MessengerError> {
        let salt_bytes = self
            .adapter
            .get(Namespace::CustomConfig, SALT_ID)
            .await?
            .ok_or_else(|| MessengerError::Corrupted("missing vault salt".into()))?;
        let salt: [u8; 16] = salt_bytes
            .try_into()
            .map_err(|_| MessengerError::Corrupted("vault salt length".into()))?;
        let old_kek = kdf::master_key_from_password(old_password, &salt)?;
        let wrapped = self
            .adapter
            .get(Namespace::CustomConfig, WRAPPED_MASTER_ID)
            .await?
            .ok_or_else(|| MessengerError::Corrupted("missing wrapped master key".into()))?;
        let master = aead::unwrap_key(&old_kek.0, &wrapped)
            .map_err(|_| MessengerError::Forbidden("invalid app password".into()))?;

        let new_salt = kdf::generate_salt();
        let new_kek = kdf::master_key_from_password(new_password, &new_salt)?;
        let rewrapped = aead::wrap_key(&new_kek.0, &master)?;
        self.adapter
            .put(Namespace::CustomConfig, SALT_ID, new_salt.to_vec())
            .await?;
        self.adapter
            .put(Namespace::CustomConfig, WRAPPED_MASTER_ID, rewrapped)
            .await?;
        *self.master.write().await = Some(master);
        Ok(())
    }

    async fn master_key(&self) -> Result<[u8; 32], MessengerError> {
        self.master
            .read()
            .await
            .as_ref()
            .copied()
            .ok_or_else(|| MessengerError::StorageFailure("store is locked".into()))
    }

    /// The AAD binds a record to its (namespace, id) slot so ciphertext
    /// cannot be replayed under a different key.
    fn record_aad(ns: Namespace, id: &str) -> Vec<u8> {
        format!("{}/{}", ns.as_str(), id).into_bytes()
    }

    pub async fn put_record<T: Serialize>(
        &self,
        ns: Namespace,
        id: &str,
        value: &T,
    ) -> Result<(), MessengerError> {
        let key = self.master_key().await?;
        let plaintext = codec::encode(value)?;
        let sealed = aead::encrypt(&key, &plaintext, &Self::record_aad(ns, id))?;
        self.adapter.put(ns, id, sealed).await
    }

    pub async fn get_record<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        id: &str,
    ) -> Result<Option<T>, MessengerError> {
        let Some(sealed) = self.adapter.get(ns, id).await? else {
            return Ok(None);
        };
        let key = self.master_key().await?;
        let plaintext = aead::decrypt(&key, &sealed, &Self::record_aad(ns, id))
            .map_err(|_| MessengerError::Corrupted(format!("unreadable record {ns}/{id}")))?;
        let value = codec::decode(&plaintext)
            .map_err(|e| MessengerError::Corrupted(format!("undecodable record {ns}/{id}: {e}")))?;
        Ok(Some(value))
    }

    pub async fn delete(&self, ns: Namespace, id: &str) -> Result<(), MessengerError> {
        self.adapter.delete(ns, id).await
    }

    pub async fn list(&self, ns: Namespace) -> Result<Vec<String>, MessengerError> {
        self.adapter.list(ns).await
    }
}
