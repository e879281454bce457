//! Interfaces of the external collaborators a reservation talks to.
//!
//! The reservation task never reaches into storage or placement directly;
//! it goes through these traits. `store_backed` implements them over a
//! [`StateStore`](capgrid_state::StateStore); tests substitute fakes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use capgrid_placement::HostSelection;
use capgrid_state::{
    CapacityPool, Endpoint, Link, PoolQuery, ResourceDescription, ResourcePool, TenantScope,
};

use crate::error::CollaboratorError;

/// Result type alias for collaborator calls.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[async_trait]
pub trait CapacityPoolStore: Send + Sync {
    /// Pools matching type, scope and minimum available count, in
    /// discovery order.
    async fn query_capacity_pools(
        &self,
        query: &PoolQuery,
    ) -> CollaboratorResult<Vec<CapacityPool>>;

    async fn resource_pool(&self, link: &str) -> CollaboratorResult<Option<ResourcePool>>;

    /// Conditionally reserve `count` instances. Insufficient capacity or a
    /// vanished pool is reported as `Conflict` or `NotFound`.
    async fn reserve_capacity(
        &self,
        pool_id: &str,
        description_link: &str,
        count: u64,
    ) -> CollaboratorResult<CapacityPool>;
}

#[async_trait]
pub trait DescriptionStore: Send + Sync {
    async fn get_description(&self, link: &str) -> CollaboratorResult<ResourceDescription>;
}

/// Profiles usable with one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub resource_pool_link: Link,
    pub endpoint: Endpoint,
    pub profile_links: Vec<Link>,
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// Profiles whose networks can serve every network interface of `desc`.
    async fn network_profile_constraints(
        &self,
        desc: &ResourceDescription,
        scope: &TenantScope,
    ) -> CollaboratorResult<BTreeSet<Link>>;

    /// Endpoints backing `resource_pool_links` with the profiles usable on
    /// each. `endpoint_link` pins resolution to one endpoint; a non-empty
    /// `profile_constraints` restricts the acceptable profiles.
    async fn resolve_profiles(
        &self,
        resource_pool_links: &BTreeSet<Link>,
        endpoint_link: Option<&str>,
        scope: &TenantScope,
        profile_constraints: &BTreeSet<Link>,
    ) -> CollaboratorResult<Vec<ProfileEntry>>;
}

#[async_trait]
pub trait DescriptionEnhancer: Send + Sync {
    /// Complete a copy of a description with what `profile_link` provides.
    async fn enhance(
        &self,
        profile_link: &str,
        desc: ResourceDescription,
    ) -> CollaboratorResult<ResourceDescription>;
}

/// Input of a host selection.
#[derive(Debug, Clone)]
pub struct HostSelectionRequest {
    /// Candidate resource pools with the resolved per-instance memory on
    /// each.
    pub resource_pools: BTreeMap<Link, u64>,
    pub resource_count: u64,
    pub scope: TenantScope,
    pub correlation_id: String,
    pub description: ResourceDescription,
}

#[async_trait]
pub trait PlacementSelector: Send + Sync {
    /// Concrete hosts for the request. Every resource pool present in the
    /// answer must carry all `resource_count` instances on its own hosts.
    /// An empty answer means no host is eligible; `Rejected` means eligible
    /// hosts cannot take the count.
    async fn select_hosts(
        &self,
        request: HostSelectionRequest,
    ) -> CollaboratorResult<Vec<HostSelection>>;
}

/// Everything a reservation task calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub pools: Arc<dyn CapacityPoolStore>,
    pub descriptions: Arc<dyn DescriptionStore>,
    pub profiles: Arc<dyn ProfileResolver>,
    pub enhancer: Arc<dyn DescriptionEnhancer>,
    pub placement: Arc<dyn PlacementSelector>,
}

// ── Request-scoped description cache ───────────────────────────────

/// Descriptions fetched while serving one request.
///
/// Cloning shares the cache. Create one per request (or per batch of
/// related requests); it is never process-wide.
#[derive(Debug, Clone, Default)]
pub struct DescriptionCache {
    entries: Arc<Mutex<HashMap<Link, ResourceDescription>>>,
}

impl DescriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, link: &str) -> Option<ResourceDescription> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(link).cloned()
    }

    pub fn insert(&self, link: &str, desc: ResourceDescription) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(link.to_string(), desc);
    }

    /// Cached description, fetched from `store` on first use.
    pub async fn get_or_fetch(
        &self,
        link: &str,
        store: &dyn DescriptionStore,
    ) -> CollaboratorResult<ResourceDescription> {
        if let Some(desc) = self.get(link) {
            return Ok(desc);
        }
        let desc = store.get_description(link).await?;
        self.insert(link, desc.clone());
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DescriptionStore for CountingStore {
        async fn get_description(&self, link: &str) -> CollaboratorResult<ResourceDescription> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_value(serde_json::json!({
                "id": link,
                "name": "web",
                "resource_type": "compute"
            }))
            .unwrap())
        }
    }

    #[tokio::test]
    async fn cache_fetches_once_per_link() {
        let store = CountingStore {
            fetches: AtomicUsize::new(0),
        };
        let cache = DescriptionCache::new();
        let shared = cache.clone();

        cache.get_or_fetch("/descriptions/web", &store).await.unwrap();
        shared.get_or_fetch("/descriptions/web", &store).await.unwrap();
        cache.get_or_fetch("/descriptions/db", &store).await.unwrap();

        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_hits_by_requested_link() {
        struct AliasStore {
            fetches: AtomicUsize,
        }

        #[async_trait]
        impl DescriptionStore for AliasStore {
            async fn get_description(
                &self,
                _link: &str,
            ) -> CollaboratorResult<ResourceDescription> {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::from_value(serde_json::json!({
                    "id": "/descriptions/canonical",
                    "name": "web",
                    "resource_type": "compute"
                }))
                .unwrap())
            }
        }

        let store = AliasStore {
            fetches: AtomicUsize::new(0),
        };
        let cache = DescriptionCache::new();
        let first = cache.get_or_fetch("/aliases/web", &store).await.unwrap();
        let second = cache.get_or_fetch("/aliases/web", &store).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
        assert!(cache.get("/descriptions/canonical").is_none());
    }

    #[tokio::test]
    async fn separate_caches_do_not_share_entries() {
        let store = CountingStore {
            fetches: AtomicUsize::new(0),
        };
        DescriptionCache::new()
            .get_or_fetch("/descriptions/web", &store)
            .await
            .unwrap();
        DescriptionCache::new()
            .get_or_fetch("/descriptions/web", &store)
            .await
            .unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }
}
