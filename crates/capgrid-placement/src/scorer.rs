//! Host scoring for placement decisions.
//!
//! Evaluates candidate hosts using a weighted combination of:
//! - **Bin-packing** (best-fit): prefer hosts that will be most full after placement
//! - **Affinity**: prefer hosts whose topology tags match soft constraints
//! - **Balance**: penalize hosts far from the average utilization
//!
//! Hosts that are powered off or cannot fit a single instance are rejected.

use std::collections::BTreeSet;

use capgrid_core::config::PlacementWeightsConfig;
use capgrid_state::ComputeHost;

use crate::affinity::TopologyTags;

/// Requirements for placing instances on hosts.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequirements {
    /// Memory needed per instance in bytes. 0 = no memory accounting.
    pub memory_bytes: u64,
    /// Number of instances to place.
    pub instance_count: u32,
    /// Topology tags that add score when present.
    pub preferred_tags: BTreeSet<String>,
}

/// Scored placement result for a single host.
#[derive(Debug, Clone)]
pub struct HostScore {
    pub host_link: String,
    /// Total composite score (higher = better). Range: 0.0..=100.0.
    pub score: f64,
    /// How many instances this host can accept.
    pub capacity: u32,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub bin_packing: f64,
    pub affinity: f64,
    pub balance: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub bin_packing: f64,
    pub affinity: f64,
    pub balance: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self::from(&PlacementWeightsConfig::default())
    }
}

impl From<&PlacementWeightsConfig> for ScoringWeights {
    fn from(config: &PlacementWeightsConfig) -> Self {
        Self {
            bin_packing: config.bin_packing,
            affinity: config.affinity,
            balance: config.balance,
        }
    }
}

fn utilization(host: &ComputeHost) -> f64 {
    if host.capacity_memory_bytes > 0 {
        host.used_memory_bytes as f64 / host.capacity_memory_bytes as f64
    } else {
        0.5
    }
}

/// Score a single host for the given requirements.
pub fn score_host(
    host: &ComputeHost,
    req: &PlacementRequirements,
    weights: &ScoringWeights,
    average_utilization: f64,
) -> Option<HostScore> {
    if !host.powered_on {
        return None;
    }

    let free_memory = host
        .capacity_memory_bytes
        .saturating_sub(host.used_memory_bytes);
    let capacity = if req.memory_bytes > 0 {
        free_memory / req.memory_bytes
    } else {
        u64::MAX
    };
    let capacity = capacity.min(u64::from(u32::MAX)) as u32;
    if capacity == 0 {
        return None;
    }

    let instances_to_place = req.instance_count.min(capacity);

    // How full will the host be after placement?
    let projected_memory = host
        .used_memory_bytes
        .saturating_add(req.memory_bytes.saturating_mul(u64::from(instances_to_place)));
    let bin_packing = if host.capacity_memory_bytes > 0 {
        (projected_memory as f64 / host.capacity_memory_bytes as f64).min(1.0) * 100.0
    } else {
        50.0
    };

    let affinity = if req.preferred_tags.is_empty() {
        50.0
    } else {
        let tags = TopologyTags::of(host).tags();
        let matched = req
            .preferred_tags
            .iter()
            .filter(|t| tags.contains(*t))
            .count();
        (matched as f64 / req.preferred_tags.len() as f64) * 100.0
    };

    let balance =
        (1.0 - (utilization(host) - average_utilization).abs()).max(0.0) * 100.0;

    let score = weights.bin_packing * bin_packing
        + weights.affinity * affinity
        + weights.balance * balance;

    Some(HostScore {
        host_link: host.id.clone(),
        score,
        capacity,
        breakdown: ScoreBreakdown {
            bin_packing,
            affinity,
            balance,
        },
    })
}

/// Score all hosts and return a sorted list (best first, ties by host id).
pub fn rank_hosts(
    hosts: &[&ComputeHost],
    req: &PlacementRequirements,
    weights: &ScoringWeights,
) -> Vec<HostScore> {
    let average = if hosts.is_empty() {
        0.5
    } else {
        hosts.iter().map(|h| utilization(h)).sum::<f64>() / hosts.len() as f64
    };

    let mut scores: Vec<HostScore> = hosts
        .iter()
        .filter_map(|h| score_host(h, req, weights, average))
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.host_link.cmp(&b.host_link))
    });
    scores
}
