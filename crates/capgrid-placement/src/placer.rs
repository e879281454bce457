//! Placement engine — picks concrete hosts for a reservation.
//!
//! Given the hosts of the candidate resource pools, the placer:
//! 1. Drops powered-off hosts
//! 2. Narrows to one affinity group when the request has affinity constraints
//! 3. Ranks the remaining hosts (using scorer) and assigns instances greedily

use std::collections::{BTreeSet, HashMap};

use capgrid_state::{ComputeHost, Occurrence};
use thiserror::Error;
use tracing::{debug, warn};

use crate::affinity::{AffinityConstraint, HostSelection, partition, select_group};
use crate::constraints::TagCondition;
use crate::convert::host_selection;
use crate::scorer::{PlacementRequirements, ScoringWeights, rank_hosts};

/// What to place.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub instance_count: u32,
    /// Memory per instance in bytes.
    pub memory_bytes: u64,
    /// Stable key of the logical request, used for group selection.
    pub correlation_id: String,
    pub affinity: Vec<AffinityConstraint>,
    /// Tag conditions of the description. Only soft ones affect host choice.
    pub conditions: Vec<TagCondition>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("only {placed} of {requested} instances fit on the selected hosts")]
    Insufficient { requested: u32, placed: u32 },
}

/// Select hosts for `req` among `hosts`.
///
/// Returns an empty selection when no host is eligible at all, and
/// [`PlacementError::Insufficient`] when eligible hosts cannot take every
/// requested instance.
pub fn select_hosts(
    hosts: &[ComputeHost],
    req: &PlacementRequest,
    weights: &ScoringWeights,
) -> Result<Vec<HostSelection>, PlacementError> {
    let eligible: Vec<ComputeHost> = hosts.iter().filter(|h| h.powered_on).cloned().collect();
    if eligible.is_empty() {
        debug!(correlation_id = %req.correlation_id, "no eligible hosts");
        return Ok(Vec::new());
    }

    let candidates: Vec<&ComputeHost> = if req.affinity.is_empty() {
        eligible.iter().collect()
    } else {
        let mut groups = partition(&eligible);
        match select_group(&groups, &req.correlation_id, &req.conditions) {
            Some(index) => groups.swap_remove(index),
            None => Vec::new(),
        }
    };

    let preferred_tags: BTreeSet<String> = req
        .conditions
        .iter()
        .filter(|c| !c.is_hard() && c.occurrence == Occurrence::MustOccur)
        .map(|c| c.tag.clone())
        .collect();
    let requirements = PlacementRequirements {
        memory_bytes: req.memory_bytes,
        instance_count: req.instance_count,
        preferred_tags,
    };

    let by_link: HashMap<&str, &ComputeHost> =
        candidates.iter().map(|h| (h.id.as_str(), *h)).collect();
    let ranked = rank_hosts(&candidates, &requirements, weights);

    let mut remaining = req.instance_count;
    let mut selections = Vec::new();
    for scored in &ranked {
        if remaining == 0 {
            break;
        }
        let Some(host) = by_link.get(scored.host_link.as_str()) else {
            continue;
        };
        let to_place = remaining.min(scored.capacity);
        selections.push(host_selection(host, to_place));
        remaining -= to_place;
        debug!(
            host = %scored.host_link,
            instances = to_place,
            score = scored.score,
            "placed instances"
        );
    }

    if remaining > 0 {
        warn!(
            correlation_id = %req.correlation_id,
            remaining,
            "could not place all instances, insufficient host capacity"
        );
        return Err(PlacementError::Insufficient {
            requested: req.instance_count,
            placed: req.instance_count - remaining,
        });
    }

    Ok(selections)
}
