//! Inventory files: a TOML document describing pools, endpoints, profiles,
//! descriptions and hosts, used to seed a state store.
//!
//! ```toml
//! [[capacity_pools]]
//! id = "/placements/dev"
//! name = "dev"
//! resource_type = "compute"
//! priority = 1
//! max_instances = 10
//! available_instances = 10
//! resource_pool_link = "/pools/dev"
//!
//! [[resource_pools]]
//! id = "/pools/dev"
//! name = "dev"
//! tag_links = ["env:dev"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub capacity_pools: Vec<CapacityPool>,
    #[serde(default)]
    pub resource_pools: Vec<ResourcePool>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub descriptions: Vec<ResourceDescription>,
    #[serde(default)]
    pub hosts: Vec<ComputeHost>,
}

/// Number of documents written by [`StateStore::seed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub capacity_pools: usize,
    pub resource_pools: usize,
    pub endpoints: usize,
    pub profiles: usize,
    pub descriptions: usize,
    pub hosts: usize,
}

impl Inventory {
    pub fn from_toml_str(content: &str) -> StateResult<Self> {
        toml::from_str(content).map_err(|e| StateError::Inventory(e.to_string()))
    }

    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StateError::Inventory(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Reject capacity pools pointing at resource pools the inventory does
    /// not define.
    fn check_links(&self) -> StateResult<()> {
        for pool in &self.capacity_pools {
            let known = self
                .resource_pools
                .iter()
                .any(|rp| rp.id == pool.resource_pool_link);
            if !known {
                return Err(StateError::Inventory(format!(
                    "capacity pool {} references unknown resource pool {}",
                    pool.id, pool.resource_pool_link
                )));
            }
        }
        Ok(())
    }
}

impl StateStore {
    /// Write every document of `inventory` into the store, overwriting
    /// documents with the same id.
    pub fn seed(&self, inventory: &Inventory) -> StateResult<SeedSummary> {
        inventory.check_links()?;

        for pool in &inventory.resource_pools {
            self.put_resource_pool(pool)?;
        }
        for pool in &inventory.capacity_pools {
            self.put_capacity_pool(pool)?;
        }
        for endpoint in &inventory.endpoints {
            self.put_endpoint(endpoint)?;
        }
        for profile in &inventory.profiles {
            self.put_profile(profile)?;
        }
        for desc in &inventory.descriptions {
            self.put_description(desc)?;
        }
        for host in &inventory.hosts {
            self.put_host(host)?;
        }

        let summary = SeedSummary {
            capacity_pools: inventory.capacity_pools.len(),
            resource_pools: inventory.resource_pools.len(),
            endpoints: inventory.endpoints.len(),
            profiles: inventory.profiles.len(),
            descriptions: inventory.descriptions.len(),
            hosts: inventory.hosts.len(),
        };
        info!(
            capacity_pools = summary.capacity_pools,
            resource_pools = summary.resource_pools,
            endpoints = summary.endpoints,
            profiles = summary.profiles,
            descriptions = summary.descriptions,
            hosts = summary.hosts,
            "inventory seeded"
        );
        Ok(summary)
    }
}
