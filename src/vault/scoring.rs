//! Guardian scoring
//!
//! Ranks guardian nodes for replica placement. Each factor is normalized to
//! 0.0 - 1.0 and combined as a weighted sum. Region diversity is relative to
//! the guardians already chosen for the same shard, so selection is greedy:
//! pick the best, update region counts, rescore.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::ports::ProviderInfo;
use crate::error::{Error, Result};

/// Latency at which the latency factor halves.
const LATENCY_REFERENCE_MS: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub reputation: f64,
    pub uptime: f64,
    pub latency: f64,
    pub diversity: f64,
    pub headroom: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            reputation: 0.30,
            uptime: 0.25,
            latency: 0.15,
            diversity: 0.20,
            headroom: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.reputation, self.uptime, self.latency, self.diversity, self.headroom];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Config("vault.weights must be finite and non-negative".into()));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(Error::Config("vault.weights must not all be zero".into()));
        }
        Ok(())
    }

    fn total(&self) -> f64 {
        self.reputation + self.uptime + self.latency + self.diversity + self.headroom
    }
}

/// Score of one guardian given how many already-chosen guardians share its
/// region. Normalized to 0.0 - 1.0.
pub fn score(guardian: &ProviderInfo, same_region: usize, weights: &ScoringWeights) -> f64 {
    let latency = 1.0 / (1.0 + guardian.latency_ms as f64 / LATENCY_REFERENCE_MS);
    let diversity = 1.0 / (1.0 + same_region as f64);

    let sum = weights.reputation * guardian.reputation.clamp(0.0, 1.0)
        + weights.uptime * guardian.uptime.clamp(0.0, 1.0)
        + weights.latency * latency
        + weights.diversity * diversity
        + weights.headroom * guardian.headroom();

    sum / weights.total()
}

/// Whether `guardian` may hold replicas of a file owned by `owner`.
pub fn is_eligible(guardian: &ProviderInfo, owner: &str, min_free_bytes: u64) -> bool {
    guardian.online && guardian.owner.as_deref() != Some(owner) && guardian.free_bytes() >= min_free_bytes
}

/// Choose up to `count` guardians, best first.
pub fn select_guardians(
    candidates: &[ProviderInfo],
    owner: &str,
    count: usize,
    min_free_bytes: u64,
    weights: &ScoringWeights,
) -> Vec<ProviderInfo> {
    let mut pool: Vec<&ProviderInfo> = candidates
        .iter()
        .filter(|g| is_eligible(g, owner, min_free_bytes))
        .collect();
    let mut regions: HashMap<&str, usize> = HashMap::new();
    let mut chosen = Vec::with_capacity(count.min(pool.len()));

    while chosen.len() < count && !pool.is_empty() {
        let mut best = 0;
        let mut best_score = f64::MIN;
        for (i, g) in pool.iter().enumerate() {
            let same = regions.get(g.region.as_str()).copied().unwrap_or(0);
            let s = score(g, same, weights);
            // Ties go to the lexicographically smaller id
            if s > best_score || (s == best_score && g.id < pool[best].id) {
                best = i;
                best_score = s;
            }
        }
        let picked = pool.swap_remove(best);
        *regions.entry(picked.region.as_str()).or_default() += 1;
        chosen.push(picked.clone());
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardian(id: &str, region: &str) -> ProviderInfo {
        let mut g = ProviderInfo::new(id, region);
        g.capacity_bytes = 1_000_000;
        g.latency_ms = 50;
        g
    }

    #[test]
    fn test_score_prefers_reliable() {
        let weights = ScoringWeights::default();
        let good = guardian("a", "eu");
        let mut flaky = guardian("b", "eu");
        flaky.uptime = 0.5;
        flaky.reputation = 0.4;

        assert!(score(&good, 0, &weights) > score(&flaky, 0, &weights));
        assert!(score(&good, 0, &weights) > score(&good, 2, &weights));
        assert!(score(&good, 0, &weights) <= 1.0);
    }

    #[test]
    fn test_selection_spreads_regions() {
        let candidates = vec![
            guardian("eu-1", "eu"),
            guardian("eu-2", "eu"),
            guardian("eu-3", "eu"),
            guardian("us-1", "us"),
        ];
        let picked = select_guardians(&candidates, "owner", 2, 0, &ScoringWeights::default());
        let regions: Vec<&str> = picked.iter().map(|g| g.region.as_str()).collect();
        assert_eq!(regions.len(), 2);
        assert!(regions.contains(&"eu"));
        assert!(regions.contains(&"us"));
    }

    #[test]
    fn test_owner_and_offline_excluded() {
        let mut own = guardian("own", "eu");
        own.owner = Some("alice".into());
        let mut down = guardian("down", "us");
        down.online = false;
        let candidates = vec![own, down, guardian("ok", "ap")];

        let picked = select_guardians(&candidates, "alice", 3, 0, &ScoringWeights::default());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "ok");
    }

    #[test]
    fn test_capacity_filter() {
        let mut full = guardian("full", "eu");
        full.used_bytes = full.capacity_bytes;
        assert!(!is_eligible(&full, "x", 1));
        assert!(is_eligible(&guardian("free", "eu"), "x", 1));
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoringWeights::default().validate().is_ok());
        let zero = ScoringWeights {
            reputation: 0.0,
            uptime: 0.0,
            latency: 0.0,
            diversity: 0.0,
            headroom: 0.0,
        };
        assert!(zero.validate().is_err());
        let negative = ScoringWeights {
            latency: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }
}
