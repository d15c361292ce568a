//! In-memory provider network
//!
//! A simulated storage network implementing the `ProviderNetwork` port.
//! Nodes can be taken offline, told to refuse writes, or have stored shards
//! corrupted in place, which lets tests and the CLI simulation drive the
//! monitor, repair and vault paths through realistic failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use crate::codec::Shard;
use crate::domain::ports::{ProviderInfo, ProviderNetwork, ProviderRequirements, StoreReceipt};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Node {
    info: ProviderInfo,
    shards: HashMap<String, Shard>,
    reject_writes: bool,
}

/// Simulated provider network.
#[derive(Debug, Default)]
pub struct InMemoryProviderNetwork {
    nodes: DashMap<String, Node>,
    next_storage_id: AtomicU64,
}

impl InMemoryProviderNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network with `count` providers spread across `regions`.
    pub fn with_providers(count: usize, regions: &[&str]) -> Self {
        let network = Self::new();
        for i in 0..count {
            let region = regions.get(i % regions.len().max(1)).copied().unwrap_or("default");
            network.add_provider(ProviderInfo::new(format!("node-{}", i + 1), region));
        }
        network
    }

    pub fn add_provider(&self, info: ProviderInfo) {
        self.nodes.insert(
            info.id.clone(),
            Node {
                info,
                shards: HashMap::new(),
                reject_writes: false,
            },
        );
    }

    pub fn provider(&self, id: &str) -> Option<ProviderInfo> {
        self.nodes.get(id).map(|n| n.info.clone())
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Take a provider on or offline. Returns false for unknown ids.
    pub fn set_online(&self, id: &str, online: bool) -> bool {
        match self.nodes.get_mut(id) {
            Some(mut node) => {
                node.info.online = online;
                true
            }
            None => false,
        }
    }

    /// Make a provider answer uploads with a rejected receipt.
    pub fn set_reject_writes(&self, id: &str, reject: bool) -> bool {
        match self.nodes.get_mut(id) {
            Some(mut node) => {
                node.reject_writes = reject;
                true
            }
            None => false,
        }
    }

    /// Flip a byte of a stored payload without updating its hash.
    pub fn corrupt_shard(&self, provider_id: &str, storage_id: &str) -> bool {
        let Some(mut node) = self.nodes.get_mut(provider_id) else {
            return false;
        };
        let Some(shard) = node.shards.get_mut(storage_id) else {
            return false;
        };

        let mut payload = shard.payload.to_vec();
        match payload.first_mut() {
            Some(byte) => *byte ^= 0xFF,
            None => payload.push(0xFF),
        }
        shard.payload = Bytes::from(payload);
        true
    }

    /// Drop a stored shard as if the provider lost it.
    pub fn lose_shard(&self, provider_id: &str, storage_id: &str) -> bool {
        self.nodes
            .get_mut(provider_id)
            .map(|mut node| node.shards.remove(storage_id).is_some())
            .unwrap_or(false)
    }

    pub fn stored_count(&self, provider_id: &str) -> usize {
        self.nodes
            .get(provider_id)
            .map(|n| n.shards.len())
            .unwrap_or(0)
    }

    pub fn total_stored(&self) -> usize {
        self.nodes.iter().map(|n| n.shards.len()).sum()
    }

    fn unreachable(provider_id: &str) -> Error {
        Error::Provider {
            provider_id: provider_id.to_string(),
            reason: "provider unreachable".into(),
        }
    }

    fn unknown(provider_id: &str) -> Error {
        Error::Provider {
            provider_id: provider_id.to_string(),
            reason: "unknown provider".into(),
        }
    }
}

#[async_trait]
impl ProviderNetwork for InMemoryProviderNetwork {
    async fn find_candidate_providers(
        &self,
        count: usize,
        requirements: &ProviderRequirements,
    ) -> Result<Vec<ProviderInfo>> {
        let mut candidates: Vec<ProviderInfo> = self
            .nodes
            .iter()
            .filter(|n| requirements.accepts(&n.info))
            .map(|n| n.info.clone())
            .collect();

        candidates.sort_by(|a, b| {
            b.reputation
                .total_cmp(&a.reputation)
                .then_with(|| a.latency_ms.cmp(&b.latency_ms))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(count);
        Ok(candidates)
    }

    async fn send_shard(&self, provider_id: &str, shard: &Shard) -> Result<StoreReceipt> {
        let mut node = self
            .nodes
            .get_mut(provider_id)
            .ok_or_else(|| Self::unknown(provider_id))?;

        if !node.info.online {
            return Err(Self::unreachable(provider_id));
        }
        if node.reject_writes || node.info.free_bytes() < shard.size as u64 {
            return Ok(StoreReceipt::rejected(provider_id));
        }

        let storage_id = format!(
            "{}-{}",
            provider_id,
            self.next_storage_id.fetch_add(1, Ordering::Relaxed)
        );
        node.info.used_bytes += shard.size as u64;
        node.shards.insert(storage_id.clone(), shard.clone());

        debug!(provider = %provider_id, shard = %shard.shard_id, %storage_id, "Stored shard");
        Ok(StoreReceipt::accepted(provider_id, storage_id))
    }

    async fn fetch_shard(&self, provider_id: &str, storage_id: &str) -> Result<Shard> {
        let node = self
            .nodes
            .get(provider_id)
            .ok_or_else(|| Self::unknown(provider_id))?;

        if !node.info.online {
            return Err(Self::unreachable(provider_id));
        }
        node.shards.get(storage_id).cloned().ok_or_else(|| Error::Provider {
            provider_id: provider_id.to_string(),
            reason: format!("shard {} not found", storage_id),
        })
    }

    async fn probe(&self, provider_id: &str) -> Result<bool> {
        Ok(self
            .nodes
            .get(provider_id)
            .map(|n| n.info.online)
            .unwrap_or(false))
    }

    async fn delete_shard(&self, provider_id: &str, storage_id: &str) -> Result<()> {
        let mut node = self
            .nodes
            .get_mut(provider_id)
            .ok_or_else(|| Self::unknown(provider_id))?;

        if !node.info.online {
            return Err(Self::unreachable(provider_id));
        }
        if let Some(shard) = node.shards.remove(storage_id) {
            node.info.used_bytes = node.info.used_bytes.saturating_sub(shard.size as u64);
        }
        Ok(())
    }
}
