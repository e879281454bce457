//! Domain types for the capgrid state store.
//!
//! These types represent the persisted inventory the reservation scheduler
//! works against: capacity pools (group placements), the resource pools
//! backing them, endpoints, profiles, resource descriptions and compute
//! hosts. All types are serializable to/from JSON for storage in redb
//! tables, and to/from TOML for inventory files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use capgrid_core::{ResourceType, TenantScope};

/// Self link of a stored document, e.g. `/resources/group-placements/a`.
pub type Link = String;

// ── Capacity pool ─────────────────────────────────────────────────

/// A quota bucket with a priority and instance counters.
///
/// `max_instances == 0` means unbounded: the pool is always eligible and
/// its available counter is never decremented.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityPool {
    pub id: Link,
    pub name: String,
    pub resource_type: ResourceType,
    /// Tenant/group membership. Empty = global pool.
    #[serde(default)]
    pub tenant_links: Vec<String>,
    /// Lower value is preferred.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_instances: u64,
    #[serde(default)]
    pub available_instances: u64,
    /// Memory cap in bytes. 0 = unbounded.
    #[serde(default)]
    pub memory_limit: u64,
    #[serde(default)]
    pub available_memory: u64,
    pub resource_pool_link: Link,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// Reserved instance count per resource description link.
    #[serde(default)]
    pub reservations: BTreeMap<Link, u64>,
}

impl CapacityPool {
    pub fn is_unbounded(&self) -> bool {
        self.max_instances == 0
    }

    /// Whether `count` more instances fit the instance counters.
    pub fn has_instances_for(&self, count: u64) -> bool {
        self.is_unbounded() || self.available_instances >= count
    }

    /// Whether `count` instances of `memory_per_instance` bytes fit the
    /// memory budget.
    pub fn has_memory_for(&self, memory_per_instance: u64, count: u64) -> bool {
        self.memory_limit == 0
            || self.available_memory >= memory_per_instance.saturating_mul(count)
    }
}

// ── Resource pool ─────────────────────────────────────────────────

/// Backing infrastructure of one or more capacity pools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePool {
    pub id: Link,
    pub name: String,
    /// Tags in `key:value` form, matched by placement constraints.
    #[serde(default)]
    pub tag_links: BTreeSet<String>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

// ── Endpoint / profile ────────────────────────────────────────────

/// A cloud or container-host account backing a resource pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub id: Link,
    pub name: String,
    /// Provider type, e.g. "aws" or "vsphere".
    pub endpoint_type: String,
    #[serde(default)]
    pub region_id: Option<String>,
    pub resource_pool_link: Link,
    #[serde(default)]
    pub tenant_links: Vec<String>,
}

/// Hardware sizing a profile maps an instance type name to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceTypeSpec {
    pub cpu_count: u32,
    pub memory_bytes: u64,
}

/// Configuration profile used to complete a resource description for one
/// endpoint (instance types, images, storage, networks).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: Link,
    pub name: String,
    /// Bound to a single endpoint when set.
    #[serde(default)]
    pub endpoint_link: Option<Link>,
    /// Otherwise usable by every endpoint of this type.
    #[serde(default)]
    pub endpoint_type: Option<String>,
    #[serde(default)]
    pub tenant_links: Vec<String>,
    /// Network names this profile can attach instances to.
    #[serde(default)]
    pub networks: BTreeSet<String>,
    #[serde(default)]
    pub instance_types: BTreeMap<String, InstanceTypeSpec>,
    /// Image name → provider image id.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    #[serde(default)]
    pub storage_classes: BTreeSet<String>,
    #[serde(default)]
    pub default_storage_class: Option<String>,
}

impl Profile {
    pub fn serves(&self, endpoint: &Endpoint) -> bool {
        match (&self.endpoint_link, &self.endpoint_type) {
            (Some(link), _) => link == &endpoint.id,
            (None, Some(kind)) => kind == &endpoint.endpoint_type,
            (None, None) => false,
        }
    }
}

// ── Resource description ──────────────────────────────────────────

/// Whether a placement condition must hold or only scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    Hard,
    Soft,
}

/// Whether the tag must be present or absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occurrence {
    #[default]
    MustOccur,
    MustNotOccur,
}

/// A tag-based placement condition declared on a description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConstraint {
    /// Tag in `key:value` form.
    pub tag: String,
    pub enforcement: Enforcement,
    #[serde(default)]
    pub occurrence: Occurrence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescription {
    pub name: String,
    #[serde(default)]
    pub capacity_mb: u64,
    #[serde(default)]
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceDescription {
    pub name: String,
    /// Name of the network the interface attaches to.
    pub network: String,
}

/// The requested resource: sizing, image, disks, NICs and constraints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescription {
    pub id: Link,
    pub name: String,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub tenant_links: Vec<String>,
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub total_memory_bytes: u64,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskDescription>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceDescription>,
    #[serde(default)]
    pub constraints: Vec<PlacementConstraint>,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

/// Custom property pinning profile resolution to one endpoint.
pub const ENDPOINT_LINK_PROPERTY: &str = "__endpointLink";

/// Custom property naming the image to resolve through the profile.
pub const IMAGE_TYPE_PROPERTY: &str = "imageType";

/// Custom property stamped by the profile enhancer.
pub const PROFILE_LINK_PROPERTY: &str = "__profileLink";

impl ResourceDescription {
    pub fn endpoint_link(&self) -> Option<&str> {
        self.custom_properties
            .get(ENDPOINT_LINK_PROPERTY)
            .map(String::as_str)
    }
}

// ── Compute host ──────────────────────────────────────────────────

/// A concrete host inside a resource pool that instances land on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeHost {
    pub id: Link,
    pub name: String,
    pub resource_pool_link: Link,
    #[serde(default)]
    pub tenant_links: Vec<String>,
    #[serde(default = "default_powered_on")]
    pub powered_on: bool,
    pub capacity_memory_bytes: u64,
    #[serde(default)]
    pub used_memory_bytes: u64,
    #[serde(default)]
    pub networks: BTreeSet<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
}

fn default_powered_on() -> bool {
    true
}

// ── Queries ───────────────────────────────────────────────────────

/// Filter for [`crate::StateStore::query_capacity_pools`].
#[derive(Debug, Clone)]
pub struct PoolQuery {
    pub resource_type: ResourceType,
    pub scope: TenantScope,
    /// Pools with fewer available instances are skipped unless unbounded.
    pub min_available: u64,
}

impl PoolQuery {
    pub fn matches(&self, pool: &CapacityPool) -> bool {
        pool.resource_type == self.resource_type
            && self.scope.owns(&pool.tenant_links)
            && pool.has_instances_for(self.min_available)
    }
}
