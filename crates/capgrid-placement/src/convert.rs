//! Type conversions from state store types to placement types.
//!
//! Bridges `capgrid_state::{ComputeHost, ResourceDescription}` to the
//! placement engine's `HostSelection` and `PlacementRequest`.

use capgrid_state::{ComputeHost, ResourceDescription};

use crate::affinity::{AffinityConstraint, HostSelection, TopologyTags};
use crate::constraints::extract_tag_conditions;
use crate::placer::PlacementRequest;

/// Record `instances` instances landing on `host`.
pub fn host_selection(host: &ComputeHost, instances: u32) -> HostSelection {
    HostSelection {
        host_link: host.id.clone(),
        name: host.name.clone(),
        resource_pool_link: host.resource_pool_link.clone(),
        topology: TopologyTags::of(host),
        instances,
    }
}

/// Build the placement request for `instance_count` copies of `desc`.
pub fn description_to_request(
    desc: &ResourceDescription,
    instance_count: u32,
    correlation_id: &str,
) -> PlacementRequest {
    PlacementRequest {
        instance_count,
        memory_bytes: desc.total_memory_bytes,
        correlation_id: correlation_id.to_string(),
        affinity: AffinityConstraint::from_description(desc),
        conditions: extract_tag_conditions(desc).unwrap_or_default(),
    }
}
