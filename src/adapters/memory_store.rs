//! In-memory persistence and key resolution adapters
//!
//! Back the `KeyValueStore` and `KeyResolver` ports with concurrent maps.
//! Used by the CLI simulation and throughout the test suite.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::codec::{FileManifest, MasterKey};
use crate::domain::ports::{KeyResolver, KeyValueStore};
use crate::error::{Error, Result};

/// `KeyValueStore` over a `DashMap` keyed by (namespace, key).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// `KeyResolver` holding master keys per file, with an optional fallback.
#[derive(Debug, Default)]
pub struct InMemoryKeyResolver {
    keys: DashMap<String, MasterKey>,
    fallback: Option<MasterKey>,
}

impl InMemoryKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every file to `key` unless a per-file key is registered.
    pub fn with_fallback(key: MasterKey) -> Self {
        Self {
            keys: DashMap::new(),
            fallback: Some(key),
        }
    }

    pub fn insert(&self, file_id: impl Into<String>, key: MasterKey) {
        self.keys.insert(file_id.into(), key);
    }
}

#[async_trait]
impl KeyResolver for InMemoryKeyResolver {
    async fn master_key(&self, manifest: &FileManifest) -> Result<MasterKey> {
        if let Some(key) = self.keys.get(&manifest.file_id) {
            return Ok(key.value().clone());
        }
        self.fallback
            .clone()
            .ok_or_else(|| Error::FileNotFound(format!("no master key for {}", manifest.file_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::StateStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_namespaced_entries() {
        let store = InMemoryStore::new();
        store.set("a", "k1", vec![1]).await.unwrap();
        store.set("a", "k2", vec![2]).await.unwrap();
        store.set("b", "k1", vec![3]).await.unwrap();

        assert_eq!(store.get("a", "k1").await.unwrap(), Some(vec![1]));
        assert_eq!(store.get("b", "k1").await.unwrap(), Some(vec![3]));
        assert_eq!(store.keys("a").await.unwrap(), vec!["k1", "k2"]);

        assert!(store.delete("a", "k1").await.unwrap());
        assert!(!store.delete("a", "k1").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_state_store_json() {
        let state = StateStore::new(Arc::new(InMemoryStore::new()));
        state.put("ns", "numbers", &vec![1u32, 2, 3]).await.unwrap();

        let loaded: Option<Vec<u32>> = state.get("ns", "numbers").await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        let all: Vec<Vec<u32>> = state.load_all("ns").await.unwrap();
        assert_eq!(all.len(), 1);

        let missing: Option<u32> = state.get("ns", "absent").await.unwrap();
        assert!(missing.is_none());
    }
}
