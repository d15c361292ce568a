//! Domain Ports (Port/Adapter Pattern)
//!
//! Core abstractions the engine depends on. Adapters implement these traits
//! to plug in real storage networks, persistence and event sinks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Domain Layer                            │
//! │   ProviderNetwork │ KeyValueStore │ KeyResolver │ EventPub   │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                        │
//! │   InMemoryProviderNetwork │ InMemoryStore │ Broadcast/Tracing │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{FileManifest, MasterKey, Shard};
use crate::error::Result;

use super::events::DomainEvent;

// =============================================================================
// Value Objects
// =============================================================================

/// A storage node as advertised by the provider network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub region: String,
    /// 0.0 - 1.0
    pub reputation: f64,
    /// Fraction of time online, 0.0 - 1.0
    pub uptime: f64,
    pub latency_ms: u64,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    /// User operating this node, if known
    pub owner: Option<String>,
    pub online: bool,
}

impl ProviderInfo {
    pub fn new(id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            reputation: 1.0,
            uptime: 1.0,
            latency_ms: 50,
            capacity_bytes: 1 << 30,
            used_bytes: 0,
            owner: None,
            online: true,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// Fraction of capacity still free, 0.0 - 1.0.
    pub fn headroom(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.free_bytes() as f64 / self.capacity_bytes as f64
    }
}

/// Constraints for choosing placement targets.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequirements {
    pub min_free_bytes: u64,
    pub min_reputation: f64,
    /// Providers that must not be returned
    pub exclude: HashSet<String>,
}

impl ProviderRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    pub fn with_min_reputation(mut self, reputation: f64) -> Self {
        self.min_reputation = reputation;
        self
    }

    pub fn excluding<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn accepts(&self, provider: &ProviderInfo) -> bool {
        provider.online
            && !self.exclude.contains(&provider.id)
            && provider.free_bytes() >= self.min_free_bytes
            && provider.reputation >= self.min_reputation
    }
}

/// Acknowledgement of a shard upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    pub success: bool,
    pub provider_id: String,
    /// Provider handle for later fetch/delete; set when `success`
    pub storage_id: Option<String>,
}

impl StoreReceipt {
    pub fn accepted(provider_id: impl Into<String>, storage_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_id: provider_id.into(),
            storage_id: Some(storage_id.into()),
        }
    }

    pub fn rejected(provider_id: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_id: provider_id.into(),
            storage_id: None,
        }
    }
}

// =============================================================================
// Provider Network Port
// =============================================================================

/// Port for the storage network that holds shards.
#[async_trait]
pub trait ProviderNetwork: Send + Sync {
    /// Find up to `count` providers satisfying `requirements`.
    async fn find_candidate_providers(
        &self,
        count: usize,
        requirements: &ProviderRequirements,
    ) -> Result<Vec<ProviderInfo>>;

    /// Upload a shard to a provider.
    async fn send_shard(&self, provider_id: &str, shard: &Shard) -> Result<StoreReceipt>;

    /// Download a previously stored shard.
    async fn fetch_shard(&self, provider_id: &str, storage_id: &str) -> Result<Shard>;

    /// Liveness check. `Ok(false)` and `Err` both mean unreachable.
    async fn probe(&self, provider_id: &str) -> Result<bool>;

    /// Remove a stored shard.
    async fn delete_shard(&self, provider_id: &str, storage_id: &str) -> Result<()>;
}

// =============================================================================
// Persistence Port
// =============================================================================

/// Well-known store namespaces.
pub mod namespaces {
    pub const MANIFESTS: &str = "manifests";
    pub const GUARDIAN_CONFIGS: &str = "guardian_configs";
    pub const RECOVERY_SESSIONS: &str = "recovery_sessions";
    pub const VAULT_RECORDS: &str = "vault_records";
}

/// Port for namespaced byte storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    async fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Typed JSON view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.inner.get(namespace, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize + Sync>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.set(namespace, key, bytes).await
    }

    pub async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        self.inner.delete(namespace, key).await
    }

    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        self.inner.keys(namespace).await
    }

    /// Load every value in a namespace.
    pub async fn load_all<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for key in self.keys(namespace).await? {
            if let Some(value) = self.get(namespace, &key).await? {
                values.push(value);
            }
        }
        Ok(values)
    }
}

// =============================================================================
// Key Resolver Port
// =============================================================================

/// Port for obtaining the master key of a file during repair.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn master_key(&self, manifest: &FileManifest) -> Result<MasterKey>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
