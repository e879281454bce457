//! Collaborators backed by a local [`StateStore`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use capgrid_placement::{
    HostSelection, PlacementError, ScoringWeights, description_to_request, select_hosts,
};
use capgrid_state::{
    CapacityPool, Link, PoolQuery, ResourceDescription, ResourcePool, StateStore, TenantScope,
};
use tracing::debug;

use crate::collaborators::{
    CapacityPoolStore, CollaboratorResult, Collaborators, DescriptionStore, HostSelectionRequest,
    PlacementSelector, ProfileEntry, ProfileResolver,
};
use crate::enhancer::EnhancerChain;
use crate::error::CollaboratorError;

/// Pools, descriptions, profiles and hosts read from one store.
#[derive(Clone)]
pub struct StoreCollaborators {
    store: StateStore,
    weights: ScoringWeights,
}

impl StoreCollaborators {
    pub fn new(store: StateStore, weights: ScoringWeights) -> Self {
        Self { store, weights }
    }
}

/// The full collaborator set over `store`.
pub fn collaborators(store: StateStore, weights: ScoringWeights) -> Collaborators {
    let backed = Arc::new(StoreCollaborators::new(store.clone(), weights));
    Collaborators {
        pools: backed.clone(),
        descriptions: backed.clone(),
        profiles: backed.clone(),
        enhancer: Arc::new(EnhancerChain::standard(store)),
        placement: backed,
    }
}

#[async_trait]
impl CapacityPoolStore for StoreCollaborators {
    async fn query_capacity_pools(
        &self,
        query: &PoolQuery,
    ) -> CollaboratorResult<Vec<CapacityPool>> {
        Ok(self.store.query_capacity_pools(query)?)
    }

    async fn resource_pool(&self, link: &str) -> CollaboratorResult<Option<ResourcePool>> {
        Ok(self.store.get_resource_pool(link)?)
    }

    async fn reserve_capacity(
        &self,
        pool_id: &str,
        description_link: &str,
        count: u64,
    ) -> CollaboratorResult<CapacityPool> {
        Ok(self.store.reserve_capacity(pool_id, description_link, count)?)
    }
}

#[async_trait]
impl DescriptionStore for StoreCollaborators {
    async fn get_description(&self, link: &str) -> CollaboratorResult<ResourceDescription> {
        self.store
            .get_description(link)?
            .ok_or_else(|| CollaboratorError::NotFound(link.to_string()))
    }
}

#[async_trait]
impl ProfileResolver for StoreCollaborators {
    async fn network_profile_constraints(
        &self,
        desc: &ResourceDescription,
        scope: &TenantScope,
    ) -> CollaboratorResult<BTreeSet<Link>> {
        let required: BTreeSet<&str> = desc
            .network_interfaces
            .iter()
            .map(|nic| nic.network.as_str())
            .collect();
        let links = self
            .store
            .list_profiles()?
            .into_iter()
            .filter(|p| scope.sees(&p.tenant_links))
            .filter(|p| required.iter().all(|n| p.networks.contains(*n)))
            .map(|p| p.id)
            .collect();
        Ok(links)
    }

    async fn resolve_profiles(
        &self,
        resource_pool_links: &BTreeSet<Link>,
        endpoint_link: Option<&str>,
        scope: &TenantScope,
        profile_constraints: &BTreeSet<Link>,
    ) -> CollaboratorResult<Vec<ProfileEntry>> {
        let profiles: Vec<_> = self
            .store
            .list_profiles()?
            .into_iter()
            .filter(|p| scope.sees(&p.tenant_links))
            .filter(|p| profile_constraints.is_empty() || profile_constraints.contains(&p.id))
            .collect();

        let mut entries = Vec::new();
        for endpoint in self.store.endpoints_for_resource_pools(resource_pool_links)? {
            if endpoint_link.is_some_and(|pinned| pinned != endpoint.id) {
                continue;
            }
            if !scope.sees(&endpoint.tenant_links) {
                continue;
            }
            let profile_links: Vec<Link> = profiles
                .iter()
                .filter(|p| p.serves(&endpoint))
                .map(|p| p.id.clone())
                .collect();
            if profile_links.is_empty() {
                debug!(endpoint = %endpoint.id, "no usable profile for endpoint");
                continue;
            }
            entries.push(ProfileEntry {
                resource_pool_link: endpoint.resource_pool_link.clone(),
                endpoint,
                profile_links,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl PlacementSelector for StoreCollaborators {
    /// Places the full count inside each candidate resource pool on its own.
    /// Pools whose hosts cannot take every instance drop out of the answer.
    async fn select_hosts(
        &self,
        request: HostSelectionRequest,
    ) -> CollaboratorResult<Vec<HostSelection>> {
        let count = u32::try_from(request.resource_count).map_err(|_| {
            CollaboratorError::Rejected(format!(
                "{} instances exceed the placement limit",
                request.resource_count
            ))
        })?;

        let mut selected = Vec::new();
        let mut rejections = Vec::new();
        for (link, memory_bytes) in &request.resource_pools {
            let hosts = self
                .store
                .hosts_in_resource_pools(&BTreeSet::from([link.clone()]), &request.scope)?;
            let mut placement =
                description_to_request(&request.description, count, &request.correlation_id);
            placement.memory_bytes = *memory_bytes;

            match select_hosts(&hosts, &placement, &self.weights) {
                Ok(hosts) => selected.extend(hosts),
                Err(e @ PlacementError::Insufficient { .. }) => {
                    debug!(
                        resource_pool = %link,
                        error = %e,
                        "resource pool cannot take the count"
                    );
                    rejections.push(e.to_string());
                }
            }
        }

        if selected.is_empty() && !rejections.is_empty() {
            return Err(CollaboratorError::Rejected(rejections.join("; ")));
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capgrid_state::{ComputeHost, Endpoint, Profile};
    use std::collections::BTreeMap;

    fn endpoint(id: &str, pool: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            name: id.to_string(),
            endpoint_type: "aws".to_string(),
            region_id: None,
            resource_pool_link: pool.to_string(),
            tenant_links: Vec::new(),
        }
    }

    fn profile(id: &str, tenants: &[&str], networks: &[&str]) -> Profile {
        Profile {
            id: id.to_string(),
            name: id.to_string(),
            endpoint_link: None,
            endpoint_type: Some("aws".to_string()),
            tenant_links: tenants.iter().map(|t| t.to_string()).collect(),
            networks: networks.iter().map(|n| n.to_string()).collect(),
            instance_types: BTreeMap::new(),
            images: BTreeMap::new(),
            storage_classes: BTreeSet::new(),
            default_storage_class: None,
        }
    }

    fn backed() -> StoreCollaborators {
        let store = StateStore::open_in_memory().unwrap();
        store.put_endpoint(&endpoint("/endpoints/a", "/pools/a")).unwrap();
        store.put_endpoint(&endpoint("/endpoints/b", "/pools/b")).unwrap();
        store.put_profile(&profile("/profiles/shared", &[], &["net1"])).unwrap();
        store
            .put_profile(&profile("/profiles/tenant", &["/tenant/a"], &["net1", "net2"]))
            .unwrap();
        StoreCollaborators::new(store, ScoringWeights::default())
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    fn host(id: &str, pool: &str, memory: u64) -> ComputeHost {
        ComputeHost {
            id: id.to_string(),
            name: id.to_string(),
            resource_pool_link: pool.to_string(),
            tenant_links: Vec::new(),
            powered_on: true,
            capacity_memory_bytes: memory,
            used_memory_bytes: 0,
            networks: BTreeSet::new(),
            region_id: None,
            zone_id: None,
        }
    }

    fn selection_request(resource_pools: &[(&str, u64)], count: u64) -> HostSelectionRequest {
        HostSelectionRequest {
            resource_pools: resource_pools
                .iter()
                .map(|(link, memory)| (link.to_string(), *memory))
                .collect(),
            resource_count: count,
            scope: TenantScope::global(),
            correlation_id: "ctx-1".to_string(),
            description: serde_json::from_value(serde_json::json!({
                "id": "/descriptions/web",
                "name": "web",
                "resource_type": "compute"
            }))
            .unwrap(),
        }
    }

    fn with_hosts(hosts: &[ComputeHost]) -> StoreCollaborators {
        let backed = backed();
        for h in hosts {
            backed.store.put_host(h).unwrap();
        }
        backed
    }

    fn pools(links: &[&str]) -> BTreeSet<Link> {
        links.iter().map(|l| l.to_string()).collect()
    }

    #[tokio::test]
    async fn network_constraints_need_every_network() {
        let desc: ResourceDescription = serde_json::from_value(serde_json::json!({
            "id": "/descriptions/web",
            "name": "web",
            "resource_type": "compute",
            "network_interfaces": [
                { "name": "eth0", "network": "net1" },
                { "name": "eth1", "network": "net2" }
            ]
        }))
        .unwrap();
        let backed = backed();

        let tenant = TenantScope::new(vec!["/tenant/a".to_string()]);
        let links = backed.network_profile_constraints(&desc, &tenant).await.unwrap();
        assert_eq!(links, pools(&["/profiles/tenant"]));

        let global = backed
            .network_profile_constraints(&desc, &TenantScope::global())
            .await
            .unwrap();
        assert!(global.is_empty());
    }

    #[tokio::test]
    async fn resolve_honours_pin_and_constraints() {
        let backed = backed();
        let scope = TenantScope::new(vec!["/tenant/a".to_string()]);
        let all = backed
            .resolve_profiles(&pools(&["/pools/a", "/pools/b"]), None, &scope, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].profile_links.len(), 2);

        let pinned = backed
            .resolve_profiles(
                &pools(&["/pools/a", "/pools/b"]),
                Some("/endpoints/b"),
                &scope,
                &pools(&["/profiles/tenant"]),
            )
            .await
            .unwrap();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].resource_pool_link, "/pools/b");
        assert_eq!(pinned[0].profile_links, vec!["/profiles/tenant".to_string()]);
    }

    #[tokio::test]
    async fn missing_description_is_not_found() {
        let err = backed().get_description("/descriptions/none").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn placement_uses_resolved_memory() {
        let backed = with_hosts(&[host("/hosts/a1", "/pools/a", 8 * GIB)]);

        let err = backed
            .select_hosts(selection_request(&[("/pools/a", 4 * GIB)], 3))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));

        let selected = backed
            .select_hosts(selection_request(&[("/pools/a", 4 * GIB)], 2))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].instances, 2);
    }

    #[tokio::test]
    async fn each_resource_pool_places_the_full_count() {
        let backed = with_hosts(&[
            host("/hosts/a1", "/pools/a", 8 * GIB),
            host("/hosts/b1", "/pools/b", 8 * GIB),
            host("/hosts/b2", "/pools/b", 8 * GIB),
        ]);

        let selected = backed
            .select_hosts(selection_request(&[("/pools/a", 4 * GIB), ("/pools/b", 4 * GIB)], 3))
            .await
            .unwrap();
        assert!(selected.iter().all(|h| h.resource_pool_link == "/pools/b"));
        assert_eq!(selected.iter().map(|h| h.instances).sum::<u32>(), 3);
    }

    #[tokio::test]
    async fn pools_without_hosts_answer_empty() {
        let selected = backed()
            .select_hosts(selection_request(&[("/pools/a", GIB)], 1))
            .await
            .unwrap();
        assert!(selected.is_empty());
    }
}
