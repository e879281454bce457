//! Reservation task — picks a capacity pool, places hosts, commits.
//!
//! ```text
//! CREATED ─▶ NETWORK_CONSTRAINTS_COLLECTED ─▶ SELECTED ─▶ PLACEMENT ─▶ HOSTS_SELECTED ─┐
//!                     │ no pools                                           │ no hosts   │
//!                     ▼                                                    ▼            │
//!              QUERYING_GLOBAL ─▶ SELECTED_GLOBAL ─▶ PLACEMENT_GLOBAL ─▶ HOSTS_SELECTED_GLOBAL
//!                                                                                       │
//!                                  RESERVATION_SELECTED ◀───────────────────────────────┘
//!                                   │ ▲ conflict: pop head, retry
//!                                   ▼ │
//!                                 COMPLETED / ERROR
//! ```
//!
//! Fallback to global scope happens only from the tenant-scoped pool query
//! and from an empty host selection, and only once. Endpoint filtering and
//! tag constraints that leave no candidate are terminal. A rejected commit
//! pops the head candidate and retries with the next one; exhausting the
//! candidates fails the task.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use capgrid_placement::{HostSelection, extract_tag_conditions, filter_by_constraints};
use capgrid_state::{
    CapacityPool, ENDPOINT_LINK_PROPERTY, Link, PoolQuery, ResourceDescription, TenantScope,
};
use capgrid_task::{StageContext, StageTable, StepOutcome, SubStage, TaskKind, Transition};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborators::{Collaborators, DescriptionCache, HostSelectionRequest};
use crate::error::{CollaboratorError, ReservationError};
use crate::request::ReservationRequest;

/// Unwrap a step result or fail the task with its error.
macro_rules! step_try {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(err) => return StepOutcome::Fail(err),
        }
    };
}

// ── Substages ──────────────────────────────────────────────────────

/// Declaration order is the forward direction of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationSubStage {
    Created,
    NetworkConstraintsCollected,
    Selected,
    Placement,
    HostsSelected,
    QueryingGlobal,
    SelectedGlobal,
    PlacementGlobal,
    HostsSelectedGlobal,
    ReservationSelected,
    Completed,
    Error,
}

impl SubStage for ReservationSubStage {
    const INITIAL: Self = ReservationSubStage::Created;
    const COMPLETED: Self = ReservationSubStage::Completed;
    const ERROR: Self = ReservationSubStage::Error;
}

impl ReservationSubStage {
    fn selected(global: bool) -> Self {
        if global {
            ReservationSubStage::SelectedGlobal
        } else {
            ReservationSubStage::Selected
        }
    }

    fn placement(global: bool) -> Self {
        if global {
            ReservationSubStage::PlacementGlobal
        } else {
            ReservationSubStage::Placement
        }
    }

    fn hosts_selected(global: bool) -> Self {
        if global {
            ReservationSubStage::HostsSelectedGlobal
        } else {
            ReservationSubStage::HostsSelected
        }
    }
}

// ── Task document ──────────────────────────────────────────────────

/// A capacity pool still eligible, with its backing resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePool {
    pub pool_id: Link,
    pub resource_pool_link: Link,
    /// Per-instance memory once enhanced by the pool's profiles. The
    /// largest fitting profile wins.
    pub memory_bytes: u64,
}

/// A pool whose conditional commit was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPool {
    pub pool_id: Link,
    pub reason: String,
}

/// Working state of one reservation.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationBody {
    pub description_link: Link,
    pub resource_count: u64,
    pub tenant_scope: TenantScope,
    pub custom_properties: BTreeMap<String, String>,
    pub context_id: String,
    /// Set once the task moved to global scope; never cleared.
    pub global_fallback: bool,
    pub profile_constraints: BTreeSet<Link>,
    /// Priority order; the head is the next pool to reserve against.
    pub candidate_pools: VecDeque<CandidatePool>,
    pub selected_hosts: Vec<HostSelection>,
    pub winning_pool: Option<Link>,
    pub winning_resource_pool: Option<Link>,
    pub rejected_pools: Vec<RejectedPool>,
    #[serde(skip)]
    pub cache: DescriptionCache,
}

impl ReservationBody {
    pub fn new(request: ReservationRequest, task_id: &str, cache: DescriptionCache) -> Self {
        Self {
            context_id: request.context_id.unwrap_or_else(|| task_id.to_string()),
            description_link: request.description_link,
            resource_count: request.resource_count,
            tenant_scope: request.tenant_scope,
            custom_properties: request.custom_properties,
            global_fallback: false,
            profile_constraints: BTreeSet::new(),
            candidate_pools: VecDeque::new(),
            selected_hosts: Vec::new(),
            winning_pool: None,
            winning_resource_pool: None,
            rejected_pools: Vec::new(),
            cache,
        }
    }

    /// Scope of the current pass.
    pub fn scope(&self) -> TenantScope {
        if self.global_fallback {
            TenantScope::global()
        } else {
            self.tenant_scope.clone()
        }
    }

    fn can_fall_back(&self) -> bool {
        !self.global_fallback && !self.tenant_scope.is_global()
    }
}

/// Result delivered to the caller on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationOutput {
    pub winning_pool: Link,
    pub resource_pool_link: Link,
    /// Hosts of the winning resource pool chosen for the instances.
    pub resource_links: Vec<Link>,
    pub custom_properties: BTreeMap<String, String>,
}

/// Task kind of a compute/container reservation.
pub struct ReservationTask;

impl TaskKind for ReservationTask {
    const KIND: &'static str = "compute-reservation";

    type SubStage = ReservationSubStage;
    type Body = ReservationBody;
    type Output = ReservationOutput;
    type Error = ReservationError;

    fn validate(body: &ReservationBody) -> Result<(), String> {
        if body.resource_count < 1 {
            return Err(format!(
                "resource count must be at least 1, got {}",
                body.resource_count
            ));
        }
        Ok(())
    }

    fn output(body: &ReservationBody) -> ReservationOutput {
        let resource_pool_link = body.winning_resource_pool.clone().unwrap_or_default();
        ReservationOutput {
            winning_pool: body.winning_pool.clone().unwrap_or_default(),
            resource_links: body
                .selected_hosts
                .iter()
                .filter(|h| h.resource_pool_link == resource_pool_link)
                .map(|h| h.host_link.clone())
                .collect(),
            resource_pool_link,
            custom_properties: body.custom_properties.clone(),
        }
    }
}

// ── Stage table ────────────────────────────────────────────────────

type Outcome = StepOutcome<ReservationTask>;
type Ctx = StageContext<ReservationTask>;

/// Handlers of every active substage. PLACEMENT substages have none: the
/// task waits there for the host selection result.
pub fn stage_table() -> StageTable<ReservationTask, Collaborators> {
    use ReservationSubStage as S;
    StageTable::new()
        .on(S::Created, collect_network_constraints)
        .on(S::NetworkConstraintsCollected, query_candidates)
        .on(S::QueryingGlobal, query_candidates)
        .on(S::Selected, select_hosts)
        .on(S::SelectedGlobal, select_hosts)
        .on(S::HostsSelected, hosts_selected)
        .on(S::HostsSelectedGlobal, hosts_selected)
        .on(S::ReservationSelected, select_reservation)
}

fn unavailable(context: &str, err: CollaboratorError) -> ReservationError {
    ReservationError::CollaboratorUnavailable(format!("{context}: {err}"))
}

fn resolver_failure(err: CollaboratorError) -> ReservationError {
    match err {
        CollaboratorError::Unavailable(_) => unavailable("profile resolver", err),
        other => ReservationError::ProfileResolution(other.to_string()),
    }
}

async fn description(
    svc: &Collaborators,
    ctx: &Ctx,
) -> Result<ResourceDescription, ReservationError> {
    let body = ctx.body();
    body.cache
        .get_or_fetch(&body.description_link, svc.descriptions.as_ref())
        .await
        .map_err(|e| unavailable("resource description", e))
}

/// Move to global scope when still tenant-scoped, otherwise fail.
fn fall_back_or(ctx: &Ctx, error: ReservationError) -> Outcome {
    if !ctx.body().can_fall_back() {
        return StepOutcome::Fail(error);
    }
    info!(
        task_id = %ctx.task_id(),
        reason = %error.reason(),
        "falling back to global scope"
    );
    StepOutcome::Proceed(
        Transition::to(ReservationSubStage::QueryingGlobal).with(|b: &mut ReservationBody| {
            b.global_fallback = true;
            b.candidate_pools.clear();
            b.selected_hosts.clear();
        }),
    )
}

// ── CREATED ────────────────────────────────────────────────────────

async fn collect_network_constraints(svc: Arc<Collaborators>, ctx: Ctx) -> Outcome {
    let desc = step_try!(description(&svc, &ctx).await);
    if desc.network_interfaces.is_empty() {
        return StepOutcome::proceed(ReservationSubStage::NetworkConstraintsCollected);
    }

    let links = step_try!(
        svc.profiles
            .network_profile_constraints(&desc, &ctx.body().tenant_scope)
            .await
            .map_err(resolver_failure)
    );
    if links.is_empty() {
        return StepOutcome::Fail(ReservationError::ProfileResolution(format!(
            "no profile provides the networks required by {}",
            desc.id
        )));
    }
    debug!(
        task_id = %ctx.task_id(),
        profiles = links.len(),
        "network profile constraints collected"
    );
    StepOutcome::Proceed(
        Transition::to(ReservationSubStage::NetworkConstraintsCollected)
            .with(move |b: &mut ReservationBody| b.profile_constraints = links),
    )
}

// ── NETWORK_CONSTRAINTS_COLLECTED / QUERYING_GLOBAL ────────────────

async fn query_candidates(svc: Arc<Collaborators>, ctx: Ctx) -> Outcome {
    let body = ctx.body();
    let global = body.global_fallback;
    let scope = body.scope();
    let desc = step_try!(description(&svc, &ctx).await);

    let query = PoolQuery {
        resource_type: desc.resource_type,
        scope: scope.clone(),
        min_available: body.resource_count,
    };
    let pools = step_try!(
        svc.pools
            .query_capacity_pools(&query)
            .await
            .map_err(|e| unavailable("capacity pool query", e))
    );
    debug!(
        task_id = %ctx.task_id(),
        global,
        scope = ?scope.links(),
        found = pools.len(),
        "capacity pools queried"
    );
    if pools.is_empty() {
        return fall_back_or(
            &ctx,
            ReservationError::NoCandidate("No available group placements.".to_string()),
        );
    }

    let pools = step_try!(filter_by_endpoints(&svc, body, &desc, &scope, pools).await);
    let pools = step_try!(filter_by_tags(&svc, &desc, pools).await);

    let candidates: VecDeque<CandidatePool> = pools
        .into_iter()
        .map(|(p, memory_bytes)| CandidatePool {
            pool_id: p.id,
            resource_pool_link: p.resource_pool_link,
            memory_bytes,
        })
        .collect();
    debug!(
        task_id = %ctx.task_id(),
        candidates = candidates.len(),
        "candidate placements selected"
    );
    StepOutcome::Proceed(
        Transition::to(ReservationSubStage::selected(global))
            .with(move |b: &mut ReservationBody| b.candidate_pools = candidates),
    )
}

/// Keep pools whose backing endpoint has a profile that completes the
/// description within the pool's memory budget, paired with the resolved
/// per-instance memory.
async fn filter_by_endpoints(
    svc: &Collaborators,
    body: &ReservationBody,
    desc: &ResourceDescription,
    scope: &TenantScope,
    pools: Vec<CapacityPool>,
) -> Result<Vec<(CapacityPool, u64)>, ReservationError> {
    let links: BTreeSet<Link> = pools.iter().map(|p| p.resource_pool_link.clone()).collect();
    let entries = svc
        .profiles
        .resolve_profiles(&links, desc.endpoint_link(), scope, &body.profile_constraints)
        .await
        .map_err(resolver_failure)?;
    if entries.is_empty() {
        return Err(ReservationError::ProfileResolution(
            "No profiles found for the selected candidate placements".to_string(),
        ));
    }

    // Each profile is tried on its own copy; a failed enhancement drops
    // only that profile.
    let attempts = entries.iter().flat_map(|entry| {
        entry
            .profile_links
            .iter()
            .map(move |profile_link| (entry, profile_link))
    });
    let enhanced = join_all(attempts.map(|(entry, profile_link)| async move {
        let mut copy = desc.clone();
        copy.custom_properties
            .insert(ENDPOINT_LINK_PROPERTY.to_string(), entry.endpoint.id.clone());
        let result = svc.enhancer.enhance(profile_link, copy).await;
        (entry, profile_link, result)
    }))
    .await;

    let mut memory_by_pool: HashMap<&str, Vec<u64>> = HashMap::new();
    for (entry, profile_link, result) in enhanced {
        match result {
            Ok(enhanced) => memory_by_pool
                .entry(entry.resource_pool_link.as_str())
                .or_default()
                .push(enhanced.total_memory_bytes),
            Err(err) => debug!(
                profile = %profile_link,
                endpoint = %entry.endpoint.id,
                error = %err,
                "profile dropped"
            ),
        }
    }

    let count = body.resource_count;
    let kept: Vec<(CapacityPool, u64)> = pools
        .into_iter()
        .filter_map(|pool| {
            let memory = memory_by_pool
                .get(pool.resource_pool_link.as_str())?
                .iter()
                .copied()
                .filter(|m| pool.has_memory_for(*m, count))
                .max()?;
            Some((pool, memory))
        })
        .collect();
    if kept.is_empty() {
        return Err(ReservationError::ProfileResolution(
            "No candidate placements left after endpoint filtering".to_string(),
        ));
    }
    Ok(kept)
}

/// Apply the description's tag conditions to the backing resource pools
/// and order the survivors.
async fn filter_by_tags(
    svc: &Collaborators,
    desc: &ResourceDescription,
    pools: Vec<(CapacityPool, u64)>,
) -> Result<Vec<(CapacityPool, u64)>, ReservationError> {
    let conditions = extract_tag_conditions(desc);

    let mut tagged = Vec::with_capacity(pools.len());
    for (pool, memory) in pools {
        let tags = match &conditions {
            None => BTreeSet::new(),
            Some(_) => svc
                .pools
                .resource_pool(&pool.resource_pool_link)
                .await
                .map_err(|e| unavailable("resource pool lookup", e))?
                .map(|rp| rp.tag_links)
                .unwrap_or_default(),
        };
        tagged.push(((pool, memory), tags));
    }

    let kept = filter_by_constraints(tagged, conditions.as_deref(), |((pool, _), tags)| {
        (pool.priority, tags)
    });
    if kept.is_empty() {
        return Err(ReservationError::ConstraintUnsatisfied(format!(
            "No placement exists that satisfies all of the request requirements of {}",
            desc.id
        )));
    }
    Ok(kept.into_iter().map(|(candidate, _)| candidate).collect())
}

// ── SELECTED / SELECTED_GLOBAL ─────────────────────────────────────

async fn select_hosts(svc: Arc<Collaborators>, ctx: Ctx) -> Outcome {
    let body = ctx.body();
    let global = body.global_fallback;
    if body.candidate_pools.is_empty() {
        return StepOutcome::Fail(ReservationError::NoCandidate(
            "candidate placements empty at host selection".to_string(),
        ));
    }
    let desc = step_try!(description(&svc, &ctx).await);

    let mut resource_pools: BTreeMap<Link, u64> = BTreeMap::new();
    for candidate in &body.candidate_pools {
        let memory = resource_pools
            .entry(candidate.resource_pool_link.clone())
            .or_default();
        *memory = (*memory).max(candidate.memory_bytes);
    }
    let request = HostSelectionRequest {
        resource_pools,
        resource_count: body.resource_count,
        scope: body.scope(),
        correlation_id: body.context_id.clone(),
        description: desc,
    };

    let placement = svc.placement.clone();
    let handle = ctx.handle.clone();
    let task_id = ctx.task_id().to_string();
    tokio::spawn(async move {
        // Selection is abandoned once the task ends some other way.
        let selected = tokio::select! {
            result = placement.select_hosts(request) => result,
            _ = handle.wait_terminal() => {
                debug!(task_id = %task_id, "task ended before host selection finished");
                return;
            }
        };
        let delivered = match selected {
            Ok(hosts) => {
                debug!(task_id = %task_id, hosts = hosts.len(), "host selection finished");
                handle.patch(
                    Transition::to(ReservationSubStage::hosts_selected(global))
                        .with(move |b: &mut ReservationBody| b.selected_hosts = hosts),
                )
            }
            Err(CollaboratorError::Unavailable(reason)) => handle.fail(
                ReservationError::CollaboratorUnavailable(format!("placement selector: {reason}")),
            ),
            Err(err) => handle.fail(ReservationError::PlacementFailure(err.to_string())),
        };
        if delivered.is_err() {
            debug!(task_id = %task_id, "task gone before host selection finished");
        }
    });

    StepOutcome::proceed(ReservationSubStage::placement(global))
}

// ── HOSTS_SELECTED / HOSTS_SELECTED_GLOBAL ─────────────────────────

async fn hosts_selected(_svc: Arc<Collaborators>, ctx: Ctx) -> Outcome {
    let body = ctx.body();
    if body.selected_hosts.is_empty() {
        return fall_back_or(
            &ctx,
            ReservationError::PlacementFailure(
                "Available compute host can't be selected.".to_string(),
            ),
        );
    }

    // A pool is only committed against when its own hosts carry every
    // instance.
    let mut placed: HashMap<&str, u64> = HashMap::new();
    for host in &body.selected_hosts {
        *placed.entry(host.resource_pool_link.as_str()).or_default() += u64::from(host.instances);
    }
    let remaining: VecDeque<CandidatePool> = body
        .candidate_pools
        .iter()
        .filter(|c| {
            placed
                .get(c.resource_pool_link.as_str())
                .is_some_and(|n| *n >= body.resource_count)
        })
        .cloned()
        .collect();
    if remaining.is_empty() {
        return StepOutcome::Fail(ReservationError::PlacementFailure(format!(
            "no candidate placement hosts all {} instances on its own hosts",
            body.resource_count
        )));
    }

    debug!(
        task_id = %ctx.task_id(),
        hosts = body.selected_hosts.len(),
        candidates = remaining.len(),
        "candidates narrowed to selected hosts"
    );
    StepOutcome::Proceed(
        Transition::to(ReservationSubStage::ReservationSelected)
            .with(move |b: &mut ReservationBody| b.candidate_pools = remaining),
    )
}

// ── RESERVATION_SELECTED ───────────────────────────────────────────

async fn select_reservation(svc: Arc<Collaborators>, ctx: Ctx) -> Outcome {
    let body = ctx.body();
    let Some(head) = body.candidate_pools.front() else {
        let error = if body.rejected_pools.is_empty() {
            ReservationError::NoCandidate("no candidate placements left to reserve".to_string())
        } else {
            ReservationError::ReservationConflict(format!(
                "all {} candidate placements rejected the reservation",
                body.rejected_pools.len()
            ))
        };
        return StepOutcome::Fail(error);
    };

    let reserved = svc
        .pools
        .reserve_capacity(&head.pool_id, &body.description_link, body.resource_count)
        .await;
    match reserved {
        Ok(pool) => {
            info!(
                task_id = %ctx.task_id(),
                pool = %pool.id,
                count = body.resource_count,
                remaining = pool.available_instances,
                "reservation committed"
            );
            let resource_pool = head.resource_pool_link.clone();
            StepOutcome::Proceed(Transition::to(ReservationSubStage::Completed).with(
                move |b: &mut ReservationBody| {
                    b.winning_pool = Some(pool.id);
                    b.winning_resource_pool = Some(resource_pool);
                    b.custom_properties.extend(pool.custom_properties);
                },
            ))
        }
        Err(CollaboratorError::Unavailable(reason)) => StepOutcome::Fail(
            ReservationError::CollaboratorUnavailable(format!("capacity reservation: {reason}")),
        ),
        Err(err) => {
            warn!(
                task_id = %ctx.task_id(),
                pool = %head.pool_id,
                reason = %err,
                left = body.candidate_pools.len() - 1,
                "reservation rejected, trying next candidate"
            );
            let rejected = RejectedPool {
                pool_id: head.pool_id.clone(),
                reason: err.to_string(),
            };
            StepOutcome::Proceed(Transition::to(ReservationSubStage::ReservationSelected).with(
                move |b: &mut ReservationBody| {
                    b.candidate_pools.pop_front();
                    b.rejected_pools.push(rejected);
                },
            ))
        }
    }
}
