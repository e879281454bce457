//! Shared fixtures for reservation integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capgrid_placement::{HostSelection, ScoringWeights};
use capgrid_scheduler::{
    CapacityPoolStore, CollaboratorError, CollaboratorResult, Collaborators, HostSelectionRequest,
    PlacementSelector, ReservationCompletion, ReservationRequest, ReservationScheduler,
    ReservationTask, collaborators,
};
use capgrid_state::{
    CapacityPool, ComputeHost, Endpoint, Inventory, PoolQuery, ResourcePool, StateStore,
    TenantScope,
};
use capgrid_task::TaskHandle;
use tokio::sync::mpsc;

pub const TENANT: &str = "/tenant/a";
pub const WEB: &str = "/descriptions/web";

const INVENTORY: &str = r#"
[[resource_pools]]
id = "/pools/tenant"
name = "tenant"
tag_links = ["env:dev"]

[[resource_pools]]
id = "/pools/global"
name = "global"
tag_links = ["env:prod"]

[[capacity_pools]]
id = "/placements/tenant"
name = "tenant"
resource_type = "compute"
tenant_links = ["/tenant/a"]
priority = 1
max_instances = 10
available_instances = 10
resource_pool_link = "/pools/tenant"
custom_properties = { owner = "team-a" }

[[capacity_pools]]
id = "/placements/global"
name = "global"
resource_type = "compute"
priority = 1
resource_pool_link = "/pools/global"

[[endpoints]]
id = "/endpoints/tenant-aws"
name = "tenant-aws"
endpoint_type = "aws"
region_id = "us-east-1"
resource_pool_link = "/pools/tenant"

[[endpoints]]
id = "/endpoints/global-aws"
name = "global-aws"
endpoint_type = "aws"
region_id = "eu-west-1"
resource_pool_link = "/pools/global"

[[profiles]]
id = "/profiles/aws"
name = "aws"
endpoint_type = "aws"
networks = ["net1"]
instance_types = { small = { cpu_count = 1, memory_bytes = 1073741824 } }
images = { ubuntu = "ami-123" }

[[descriptions]]
id = "/descriptions/web"
name = "web"
resource_type = "compute"
instance_type = "small"
custom_properties = { imageType = "ubuntu" }

[[hosts]]
id = "/hosts/t1"
name = "t1"
resource_pool_link = "/pools/tenant"
capacity_memory_bytes = 8589934592
networks = ["net1"]

[[hosts]]
id = "/hosts/t2"
name = "t2"
resource_pool_link = "/pools/tenant"
capacity_memory_bytes = 8589934592
networks = ["net1"]

[[hosts]]
id = "/hosts/g1"
name = "g1"
resource_pool_link = "/pools/global"
capacity_memory_bytes = 8589934592
networks = ["net1"]
"#;

/// One tenant pool and one global pool, each with an endpoint and hosts.
pub fn base_inventory() -> Inventory {
    Inventory::from_toml_str(INVENTORY).unwrap()
}

/// A tenant pool on the shared tenant resource pool.
pub fn tenant_pool(id: &str, priority: i32, available: u64) -> CapacityPool {
    let mut pool = base_inventory()
        .capacity_pools
        .into_iter()
        .find(|p| p.id == "/placements/tenant")
        .unwrap();
    pool.id = id.to_string();
    pool.name = id.to_string();
    pool.priority = priority;
    pool.max_instances = 10;
    pool.available_instances = available;
    pool
}

/// Tenant pool `id` backed by resource pool `resource_pool`.
pub fn tenant_pool_on(
    id: &str,
    resource_pool: &str,
    priority: i32,
    available: u64,
) -> CapacityPool {
    let mut pool = tenant_pool(id, priority, available);
    pool.resource_pool_link = resource_pool.to_string();
    pool
}

/// Add resource pool `link` with an aws endpoint and `hosts` 8 GiB hosts on
/// net1.
pub fn add_resource_pool(inventory: &mut Inventory, link: &str, tags: &[&str], hosts: usize) {
    let name = link.rsplit('/').next().unwrap_or(link).to_string();
    inventory.resource_pools.push(ResourcePool {
        id: link.to_string(),
        name: name.clone(),
        tag_links: tags.iter().map(|t| t.to_string()).collect(),
        custom_properties: Default::default(),
    });
    inventory.endpoints.push(Endpoint {
        id: format!("/endpoints/{name}-aws"),
        name: format!("{name}-aws"),
        endpoint_type: "aws".to_string(),
        region_id: Some("us-east-1".to_string()),
        resource_pool_link: link.to_string(),
        tenant_links: Vec::new(),
    });
    for i in 1..=hosts {
        inventory.hosts.push(ComputeHost {
            id: format!("/hosts/{name}-{i}"),
            name: format!("{name}-{i}"),
            resource_pool_link: link.to_string(),
            tenant_links: Vec::new(),
            powered_on: true,
            capacity_memory_bytes: 8 << 30,
            used_memory_bytes: 0,
            networks: ["net1".to_string()].into(),
            region_id: None,
            zone_id: None,
        });
    }
}

/// Set the memory of the "small" instance type every profile offers.
pub fn set_instance_memory(inventory: &mut Inventory, memory_bytes: u64) {
    for profile in &mut inventory.profiles {
        if let Some(spec) = profile.instance_types.get_mut("small") {
            spec.memory_bytes = memory_bytes;
        }
    }
}

/// Pool store that records calls and rejects commits on chosen pools.
pub struct RecordingPools {
    inner: Arc<dyn CapacityPoolStore>,
    conflicts: BTreeSet<String>,
    pub queries: Mutex<Vec<TenantScope>>,
    pub reservations: Mutex<Vec<String>>,
}

impl RecordingPools {
    pub fn query_scopes(&self) -> Vec<TenantScope> {
        self.queries.lock().unwrap().clone()
    }

    pub fn reserve_calls(&self) -> Vec<String> {
        self.reservations.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapacityPoolStore for RecordingPools {
    async fn query_capacity_pools(
        &self,
        query: &PoolQuery,
    ) -> CollaboratorResult<Vec<CapacityPool>> {
        self.queries.lock().unwrap().push(query.scope.clone());
        self.inner.query_capacity_pools(query).await
    }

    async fn resource_pool(&self, link: &str) -> CollaboratorResult<Option<ResourcePool>> {
        self.inner.resource_pool(link).await
    }

    async fn reserve_capacity(
        &self,
        pool_id: &str,
        description_link: &str,
        count: u64,
    ) -> CollaboratorResult<CapacityPool> {
        self.reservations.lock().unwrap().push(pool_id.to_string());
        if self.conflicts.contains(pool_id) {
            return Err(CollaboratorError::Conflict(format!("{pool_id} changed concurrently")));
        }
        self.inner
            .reserve_capacity(pool_id, description_link, count)
            .await
    }
}

/// Placement that never answers. `abandoned` flips once a pending call is
/// dropped.
#[derive(Default)]
pub struct StalledPlacement {
    pub abandoned: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlacementSelector for StalledPlacement {
    async fn select_hosts(
        &self,
        _request: HostSelectionRequest,
    ) -> CollaboratorResult<Vec<HostSelection>> {
        let _guard = SetOnDrop(self.abandoned.clone());
        futures::future::pending().await
    }
}

impl StalledPlacement {
    pub fn was_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub store: StateStore,
    pub pools: Arc<RecordingPools>,
    pub collaborators: Collaborators,
}

impl Harness {
    pub fn new(inventory: &Inventory) -> Self {
        Self::with_conflicts(inventory, &[])
    }

    pub fn with_conflicts(inventory: &Inventory, conflicts: &[&str]) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        store.seed(inventory).unwrap();

        let mut collaborators = collaborators(store.clone(), ScoringWeights::default());
        let pools = Arc::new(RecordingPools {
            inner: collaborators.pools.clone(),
            conflicts: conflicts.iter().map(|c| c.to_string()).collect(),
            queries: Mutex::new(Vec::new()),
            reservations: Mutex::new(Vec::new()),
        });
        collaborators.pools = pools.clone();
        Self {
            store,
            pools,
            collaborators,
        }
    }

    pub fn scheduler(&self) -> ReservationScheduler {
        ReservationScheduler::new(self.collaborators.clone()).with_journal(self.store.clone())
    }

    pub fn available(&self, pool_id: &str) -> u64 {
        self.store
            .get_capacity_pool(pool_id)
            .unwrap()
            .unwrap()
            .available_instances
    }
}

/// Submit `request` and wait for its terminal notification.
pub async fn reserve(
    scheduler: &ReservationScheduler,
    request: ReservationRequest,
) -> (TaskHandle<ReservationTask>, ReservationCompletion) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReservationCompletion>();
    let handle = scheduler.submit(request, Arc::new(tx)).await.unwrap();
    let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    (handle, completion)
}
