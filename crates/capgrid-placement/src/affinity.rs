//! Host affinity grouping.
//!
//! Hosts are connected when they share a network or an availability zone
//! (zones are qualified by region; a shared region alone does not connect
//! two hosts). Connected components are the affinity groups. One group is
//! picked per logical request: groups are ranked by soft tag matches and
//! size, and the correlation id hashes into the best-ranked tier. Groups are
//! put in a canonical order first, so host discovery order never changes
//! the outcome.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use capgrid_state::{ComputeHost, Link, ResourceDescription};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use union_find::{QuickUnionUf, UnionBySize, UnionFind};

use crate::constraints::TagCondition;

/// Topology memberships of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyTags {
    pub networks: BTreeSet<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
}

impl TopologyTags {
    pub fn of(host: &ComputeHost) -> Self {
        Self {
            networks: host.networks.clone(),
            region: host.region_id.clone(),
            zone: host.zone_id.clone(),
        }
    }

    /// Keys shared by connected hosts.
    fn connection_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .networks
            .iter()
            .map(|n| format!("network:{n}"))
            .collect();
        if let Some(zone) = &self.zone {
            let region = self.region.as_deref().unwrap_or_default();
            keys.push(format!("zone:{region}/{zone}"));
        }
        keys
    }

    /// Tags in `key:value` form, as matched by tag conditions.
    pub fn tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> =
            self.networks.iter().map(|n| format!("network:{n}")).collect();
        if let Some(region) = &self.region {
            tags.insert(format!("region:{region}"));
        }
        if let Some(zone) = &self.zone {
            tags.insert(format!("zone:{zone}"));
        }
        tags
    }
}

/// A concrete host chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSelection {
    pub host_link: Link,
    pub name: String,
    pub resource_pool_link: Link,
    pub topology: TopologyTags,
    /// Instances assigned to this host.
    pub instances: u32,
}

/// "Instances must share network X", derived from a description's NICs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AffinityConstraint {
    pub network: String,
}

impl AffinityConstraint {
    /// One constraint per distinct network the description attaches to.
    pub fn from_description(desc: &ResourceDescription) -> Vec<Self> {
        let networks: BTreeSet<&str> = desc
            .network_interfaces
            .iter()
            .map(|nic| nic.network.as_str())
            .collect();
        networks
            .into_iter()
            .map(|network| Self {
                network: network.to_string(),
            })
            .collect()
    }
}

/// Partition hosts into connected groups.
///
/// Members are sorted by id and groups by their smallest member id.
pub fn partition(hosts: &[ComputeHost]) -> Vec<Vec<&ComputeHost>> {
    let mut dsu = QuickUnionUf::<UnionBySize>::new(hosts.len());
    let mut first_owner: HashMap<String, usize> = HashMap::new();

    for (i, host) in hosts.iter().enumerate() {
        for key in TopologyTags::of(host).connection_keys() {
            match first_owner.get(&key) {
                Some(&owner) => {
                    dsu.union(owner, i);
                }
                None => {
                    first_owner.insert(key, i);
                }
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<&ComputeHost>> = BTreeMap::new();
    for (i, host) in hosts.iter().enumerate() {
        components.entry(dsu.find(i)).or_default().push(host);
    }

    let mut groups: Vec<Vec<&ComputeHost>> = components
        .into_values()
        .map(|mut members| {
            members.sort_by(|a, b| a.id.cmp(&b.id));
            members
        })
        .collect();
    groups.sort_by(|a, b| a[0].id.cmp(&b[0].id));
    groups
}

/// Stable 64-bit hash of a correlation id.
pub fn correlation_hash(correlation_id: &str) -> u64 {
    let digest = Sha256::digest(correlation_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Pick one group for `correlation_id`, returning its index in `groups`.
///
/// Groups are ranked by how many soft conditions their combined topology
/// tags satisfy, then by size. The correlation hash indexes into the
/// best-ranked tier, taken in canonical order.
pub fn select_group(
    groups: &[Vec<&ComputeHost>],
    correlation_id: &str,
    conditions: &[TagCondition],
) -> Option<usize> {
    let ranks: Vec<(usize, usize)> = groups
        .iter()
        .map(|group| {
            let tags: BTreeSet<String> = group
                .iter()
                .flat_map(|h| TopologyTags::of(h).tags())
                .collect();
            let soft = conditions
                .iter()
                .filter(|c| !c.is_hard() && c.holds(&tags))
                .count();
            (soft, group.len())
        })
        .collect();

    let best = ranks.iter().max()?;
    let tier: Vec<usize> = ranks
        .iter()
        .enumerate()
        .filter(|(_, rank)| *rank == best)
        .map(|(i, _)| i)
        .collect();

    let index = tier[(correlation_hash(correlation_id) % tier.len() as u64) as usize];
    debug!(
        correlation_id,
        groups = groups.len(),
        tier = tier.len(),
        selected = index,
        size = groups[index].len(),
        "affinity group selected"
    );
    Some(index)
}
