//! In-memory storage adapter.
//!
//! The reference `StorageAdapter`: linearizable single-key operations over a
//! plain map. Useful as-is for tests and ephemeral sessions; durable
//! embedders bring their own adapter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    error::MessengerError,
    traits::{Namespace, StorageAdapter},
};

#[derive(Default)]
pub struct MemoryStorage {
    records: Arc<Mutex<HashMap<(Namespace, String), Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get(&self, ns: Namespace, id: &str) -> Result<Option<Vec<u8>>, MessengerError> {
        let records = self.records.lock().await;
        Ok(records.get(&(ns, id.to_string())).cloned())
    }

    async fn put(&self, ns: Namespace, id: &str, bytes: Vec<u8>) -> Result<(), MessengerError> {
        let mut records = self.records.lock().await;
        records.insert((ns, id.to_string()), bytes);
        Ok(())
    }

    async fn delete(&self, ns: Namespace, id: &str) -> Result<(), MessengerError> {
        let mut records = self.records.lock().await;
        records.remove(&(ns, id.to_string()));
        Ok(())
    }

    async fn list(&self, ns: Namespace) -> Result<Vec<String>, MessengerError> {
        let records = self.records.lock().await;
        let mut ids: Vec<String> = records
            .keys()
            .filter(|(n, _)| *n == ns)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
