//! StateStore — redb-backed state persistence for capgrid.
//!
//! Provides typed CRUD operations over the placement inventory, the
//! filtered capacity-pool query, the conditional capacity reservation and
//! the task journal. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            CAPACITY_POOLS,
            RESOURCE_POOLS,
            ENDPOINTS,
            PROFILES,
            DESCRIPTIONS,
            HOSTS,
            TASKS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic document access ────────────────────────────────────

    fn put_doc<T: Serialize>(&self, table: Table, key: &str, doc: &T) -> StateResult<()> {
        let value = serde_json::to_vec(doc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_doc<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let doc: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// List documents in key order, keeping those accepted by `keep`.
    fn list_docs<T, F>(&self, table: Table, mut keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let doc: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&doc) {
                results.push(doc);
            }
        }
        Ok(results)
    }

    // ── Capacity pools ─────────────────────────────────────────────

    /// Insert or update a capacity pool.
    pub fn put_capacity_pool(&self, pool: &CapacityPool) -> StateResult<()> {
        self.put_doc(CAPACITY_POOLS, &pool.id, pool)?;
        debug!(pool = %pool.id, "capacity pool stored");
        Ok(())
    }

    pub fn get_capacity_pool(&self, id: &str) -> StateResult<Option<CapacityPool>> {
        self.get_doc(CAPACITY_POOLS, id)
    }

    pub fn list_capacity_pools(&self) -> StateResult<Vec<CapacityPool>> {
        self.list_docs(CAPACITY_POOLS, |_| true)
    }

    /// Pools of the requested type, owned by the query scope, with at least
    /// `min_available` free instances (or unbounded). Returned in key order.
    pub fn query_capacity_pools(&self, query: &PoolQuery) -> StateResult<Vec<CapacityPool>> {
        let pools = self.list_docs(CAPACITY_POOLS, |p: &CapacityPool| query.matches(p))?;
        debug!(
            resource_type = query.resource_type.label(),
            scope = ?query.scope.links(),
            min_available = query.min_available,
            matched = pools.len(),
            "capacity pool query"
        );
        Ok(pools)
    }

    /// Atomically reserve `count` instances of `pool_id` for a description.
    ///
    /// The read, the availability check and the decrement happen in one
    /// write transaction. Fails with [`StateError::Conflict`] when the pool
    /// no longer has enough instances and [`StateError::NotFound`] when the
    /// pool is gone; in both cases nothing is written.
    pub fn reserve_capacity(
        &self,
        pool_id: &str,
        description_link: &str,
        count: u64,
    ) -> StateResult<CapacityPool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let pool = {
            let mut table = txn.open_table(CAPACITY_POOLS).map_err(map_err!(Table))?;
            let current: Option<CapacityPool> = match table.get(pool_id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let Some(mut pool) = current else {
                return Err(StateError::NotFound(pool_id.to_string()));
            };

            if !pool.has_instances_for(count) {
                warn!(
                    pool = %pool_id,
                    available = pool.available_instances,
                    requested = count,
                    "reservation rejected"
                );
                return Err(StateError::Conflict(format!(
                    "{pool_id} has {} available instances, {count} requested",
                    pool.available_instances
                )));
            }

            if !pool.is_unbounded() {
                pool.available_instances -= count;
            }
            *pool
                .reservations
                .entry(description_link.to_string())
                .or_insert(0) += count;

            let value = serde_json::to_vec(&pool).map_err(map_err!(Serialize))?;
            table
                .insert(pool_id, value.as_slice())
                .map_err(map_err!(Write))?;
            pool
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            pool = %pool_id,
            description = %description_link,
            count,
            remaining = pool.available_instances,
            "capacity reserved"
        );
        Ok(pool)
    }

    // ── Resource pools ─────────────────────────────────────────────

    pub fn put_resource_pool(&self, pool: &ResourcePool) -> StateResult<()> {
        self.put_doc(RESOURCE_POOLS, &pool.id, pool)
    }

    pub fn get_resource_pool(&self, id: &str) -> StateResult<Option<ResourcePool>> {
        self.get_doc(RESOURCE_POOLS, id)
    }

    // ── Endpoints / profiles ───────────────────────────────────────

    pub fn put_endpoint(&self, endpoint: &Endpoint) -> StateResult<()> {
        self.put_doc(ENDPOINTS, &endpoint.id, endpoint)
    }

    pub fn get_endpoint(&self, id: &str) -> StateResult<Option<Endpoint>> {
        self.get_doc(ENDPOINTS, id)
    }

    /// Endpoints backing any of the given resource pools.
    pub fn endpoints_for_resource_pools(
        &self,
        resource_pool_links: &BTreeSet<Link>,
    ) -> StateResult<Vec<Endpoint>> {
        self.list_docs(ENDPOINTS, |e: &Endpoint| {
            resource_pool_links.contains(&e.resource_pool_link)
        })
    }

    pub fn put_profile(&self, profile: &Profile) -> StateResult<()> {
        self.put_doc(PROFILES, &profile.id, profile)
    }

    pub fn get_profile(&self, id: &str) -> StateResult<Option<Profile>> {
        self.get_doc(PROFILES, id)
    }

    pub fn list_profiles(&self) -> StateResult<Vec<Profile>> {
        self.list_docs(PROFILES, |_| true)
    }

    // ── Descriptions ───────────────────────────────────────────────

    pub fn put_description(&self, desc: &ResourceDescription) -> StateResult<()> {
        self.put_doc(DESCRIPTIONS, &desc.id, desc)
    }

    pub fn get_description(&self, id: &str) -> StateResult<Option<ResourceDescription>> {
        self.get_doc(DESCRIPTIONS, id)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    pub fn put_host(&self, host: &ComputeHost) -> StateResult<()> {
        self.put_doc(HOSTS, &host.id, host)
    }

    pub fn get_host(&self, id: &str) -> StateResult<Option<ComputeHost>> {
        self.get_doc(HOSTS, id)
    }

    /// Hosts inside any of the given resource pools and visible from `scope`.
    pub fn hosts_in_resource_pools(
        &self,
        resource_pool_links: &BTreeSet<Link>,
        scope: &TenantScope,
    ) -> StateResult<Vec<ComputeHost>> {
        self.list_docs(HOSTS, |h: &ComputeHost| {
            resource_pool_links.contains(&h.resource_pool_link) && scope.sees(&h.tenant_links)
        })
    }

    // ── Task journal ───────────────────────────────────────────────

    /// Record the latest snapshot of a task document.
    pub fn put_task_document(&self, task_id: &str, doc: &serde_json::Value) -> StateResult<()> {
        self.put_doc(TASKS, task_id, doc)
    }

    pub fn get_task_document(&self, task_id: &str) -> StateResult<Option<serde_json::Value>> {
        self.get_doc(TASKS, task_id)
    }

    pub fn list_task_ids(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_pool(id: &str, tenant: Option<&str>, priority: i32, available: u64) -> CapacityPool {
        CapacityPool {
            id: id.to_string(),
            name: id.trim_start_matches("/placements/").to_string(),
            resource_type: ResourceType::Compute,
            tenant_links: tenant.map(|t| vec![t.to_string()]).unwrap_or_default(),
            priority,
            max_instances: 10,
            available_instances: available,
            memory_limit: 0,
            available_memory: 0,
            resource_pool_link: "/pools/rp-1".to_string(),
            custom_properties: BTreeMap::new(),
            reservations: BTreeMap::new(),
        }
    }

    fn test_host(id: &str, rp: &str) -> ComputeHost {
        ComputeHost {
            id: id.to_string(),
            name: id.to_string(),
            resource_pool_link: rp.to_string(),
            tenant_links: Vec::new(),
            powered_on: true,
            capacity_memory_bytes: 8 * 1024 * 1024 * 1024,
            used_memory_bytes: 0,
            networks: BTreeSet::new(),
            region_id: None,
            zone_id: None,
        }
    }

    fn tenant_query(tenant: &str, min_available: u64) -> PoolQuery {
        PoolQuery {
            resource_type: ResourceType::Compute,
            scope: TenantScope::new(vec![tenant.to_string()]),
            min_available,
        }
    }

    // ── Capacity pools ─────────────────────────────────────────────

    #[test]
    fn capacity_pool_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let pool = test_pool("/placements/a", Some("/tenant/a"), 1, 5);

        store.put_capacity_pool(&pool).unwrap();
        let retrieved = store.get_capacity_pool("/placements/a").unwrap();

        assert_eq!(retrieved, Some(pool));
    }

    #[test]
    fn query_filters_scope_and_available_count() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_capacity_pool(&test_pool("/placements/a", Some("/tenant/a"), 1, 5))
            .unwrap();
        store
            .put_capacity_pool(&test_pool("/placements/b", Some("/tenant/a"), 2, 1))
            .unwrap();
        store
            .put_capacity_pool(&test_pool("/placements/c", Some("/tenant/b"), 1, 5))
            .unwrap();
        store
            .put_capacity_pool(&test_pool("/placements/global", None, 1, 5))
            .unwrap();

        let found = store
            .query_capacity_pools(&tenant_query("/tenant/a", 2))
            .unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["/placements/a"]);

        let global = store
            .query_capacity_pools(&PoolQuery {
                resource_type: ResourceType::Compute,
                scope: TenantScope::global(),
                min_available: 1,
            })
            .unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].id, "/placements/global");
    }

    #[test]
    fn query_includes_unbounded_pools() {
        let store = StateStore::open_in_memory().unwrap();
        let mut pool = test_pool("/placements/unbounded", Some("/tenant/a"), 1, 0);
        pool.max_instances = 0;
        store.put_capacity_pool(&pool).unwrap();

        let found = store
            .query_capacity_pools(&tenant_query("/tenant/a", 50))
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    // ── Reservation ────────────────────────────────────────────────

    #[test]
    fn reserve_decrements_and_records() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_capacity_pool(&test_pool("/placements/a", None, 1, 5))
            .unwrap();

        let pool = store
            .reserve_capacity("/placements/a", "/descriptions/web", 2)
            .unwrap();
        assert_eq!(pool.available_instances, 3);
        assert_eq!(pool.reservations.get("/descriptions/web"), Some(&2));

        let stored = store.get_capacity_pool("/placements/a").unwrap().unwrap();
        assert_eq!(stored, pool);
    }

    #[test]
    fn reserve_conflict_leaves_pool_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        let pool = test_pool("/placements/a", None, 1, 1);
        store.put_capacity_pool(&pool).unwrap();

        let err = store
            .reserve_capacity("/placements/a", "/descriptions/web", 2)
            .unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        assert!(err.is_conflict());
        assert_eq!(store.get_capacity_pool("/placements/a").unwrap(), Some(pool));
    }

    #[test]
    fn reserve_missing_pool_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .reserve_capacity("/placements/gone", "/descriptions/web", 1)
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert!(err.is_conflict());
    }

    #[test]
    fn reserve_unbounded_keeps_counter() {
        let store = StateStore::open_in_memory().unwrap();
        let mut pool = test_pool("/placements/a", None, 1, 0);
        pool.max_instances = 0;
        store.put_capacity_pool(&pool).unwrap();

        let reserved = store
            .reserve_capacity("/placements/a", "/descriptions/web", 7)
            .unwrap();
        assert_eq!(reserved.available_instances, 0);
        assert_eq!(reserved.reservations.get("/descriptions/web"), Some(&7));
    }

    #[test]
    fn concurrent_reservations_never_oversubscribe() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_capacity_pool(&test_pool("/placements/a", None, 1, 5))
            .unwrap();

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .reserve_capacity("/placements/a", &format!("/descriptions/{i}"), 1)
                        .is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 5);
        let pool = store.get_capacity_pool("/placements/a").unwrap().unwrap();
        assert_eq!(pool.available_instances, 0);
        assert_eq!(pool.reservations.len(), 5);
    }

    // ── Hosts / endpoints ──────────────────────────────────────────

    #[test]
    fn hosts_filtered_by_resource_pool_and_scope() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host(&test_host("/hosts/1", "/pools/rp-1")).unwrap();
        store.put_host(&test_host("/hosts/2", "/pools/rp-2")).unwrap();
        let mut private = test_host("/hosts/3", "/pools/rp-1");
        private.tenant_links = vec!["/tenant/b".to_string()];
        store.put_host(&private).unwrap();

        let links: BTreeSet<_> = ["/pools/rp-1".to_string()].into();
        let hosts = store
            .hosts_in_resource_pools(&links, &TenantScope::new(vec!["/tenant/a".to_string()]))
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id, "/hosts/1");
    }

    #[test]
    fn endpoints_filtered_by_resource_pool() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, rp) in [("/endpoints/a", "/pools/rp-1"), ("/endpoints/b", "/pools/rp-2")] {
            store
                .put_endpoint(&Endpoint {
                    id: id.to_string(),
                    name: id.to_string(),
                    endpoint_type: "aws".to_string(),
                    region_id: Some("us-east-1".to_string()),
                    resource_pool_link: rp.to_string(),
                    tenant_links: Vec::new(),
                })
                .unwrap();
        }
        let links: BTreeSet<_> = ["/pools/rp-2".to_string()].into();
        let endpoints = store.endpoints_for_resource_pools(&links).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].id, "/endpoints/b");
    }

    // ── Task journal ───────────────────────────────────────────────

    #[test]
    fn task_document_overwrites_snapshot() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_task_document("task-1", &serde_json::json!({"sub_stage": "created"}))
            .unwrap();
        store
            .put_task_document("task-1", &serde_json::json!({"sub_stage": "completed"}))
            .unwrap();

        let doc = store.get_task_document("task-1").unwrap().unwrap();
        assert_eq!(doc["sub_stage"], "completed");
        assert_eq!(store.list_task_ids().unwrap(), vec!["task-1".to_string()]);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .put_capacity_pool(&test_pool("/placements/a", None, 1, 5))
                .unwrap();
            store
                .reserve_capacity("/placements/a", "/descriptions/web", 1)
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let pool = store.get_capacity_pool("/placements/a").unwrap().unwrap();
        assert_eq!(pool.available_instances, 4);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_capacity_pools().unwrap().is_empty());
        assert!(store.list_profiles().unwrap().is_empty());
        assert!(store.get_description("nope").unwrap().is_none());
        assert!(store.get_task_document("nope").unwrap().is_none());
    }
}
