// In-memory implementation of KeyValueStore.
//
// Used when no database is configured and in tests. Nothing survives a restart.

use crate::core::moderation::{KeyValueStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// A composite key: the same key may exist in several namespaces.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
struct NamespacedKey {
    namespace: String,
    key: String,
}

#[derive(Default)]
pub struct InMemoryKvStore {
    /// Maps (namespace, key) -> value
    data: DashMap<NamespacedKey, Value>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, key: &str) -> NamespacedKey {
        NamespacedKey {
            namespace: namespace.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .data
            .get(&Self::key(namespace, key))
            .map(|v| v.value().clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.data.insert(Self::key(namespace, key), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.remove(&Self::key(namespace, key)).is_some())
    }

    async fn all(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut entries: Vec<(String, Value)> = self
            .data
            .iter()
            .filter(|entry| entry.key().namespace == namespace)
            .map(|entry| (entry.key().key.clone(), entry.value().clone()))
            .collect();
        // Same ordering as the SQLite store.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
