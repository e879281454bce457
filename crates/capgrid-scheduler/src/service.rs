//! Entry point for submitting reservations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capgrid_state::StateStore;
use capgrid_task::{TaskCallback, TaskCompletion, TaskDocument, TaskHandle, TaskRuntime};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::collaborators::{Collaborators, DescriptionCache};
use crate::error::{CollaboratorError, ReservationError};
use crate::reservation::{ReservationBody, ReservationOutput, ReservationTask, stage_table};
use crate::request::ReservationRequest;

/// Terminal notification of a reservation.
pub type ReservationCompletion = TaskCompletion<ReservationOutput, ReservationError>;

/// Starts reservation tasks against one set of collaborators.
pub struct ReservationScheduler {
    runtime: TaskRuntime<ReservationTask, Collaborators>,
    collaborators: Collaborators,
    sequence: AtomicU64,
}

impl ReservationScheduler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            runtime: TaskRuntime::new(stage_table(), Arc::new(collaborators.clone())),
            collaborators,
            sequence: AtomicU64::new(0),
        }
    }

    /// Journal every task transition to `store`.
    pub fn with_journal(mut self, store: StateStore) -> Self {
        self.runtime = self.runtime.with_journal(store);
        self
    }

    /// Validate and start a reservation with a fresh description cache.
    pub async fn submit(
        &self,
        request: ReservationRequest,
        callback: Arc<dyn TaskCallback<ReservationTask>>,
    ) -> Result<TaskHandle<ReservationTask>, ReservationError> {
        self.submit_with_cache(request, DescriptionCache::new(), callback)
            .await
    }

    /// Like [`submit`](Self::submit), sharing `cache` with related requests.
    ///
    /// The description is fetched before the task starts, so an unknown
    /// link is reported here as a validation error and no task is created.
    pub async fn submit_with_cache(
        &self,
        request: ReservationRequest,
        cache: DescriptionCache,
        callback: Arc<dyn TaskCallback<ReservationTask>>,
    ) -> Result<TaskHandle<ReservationTask>, ReservationError> {
        request.validate()?;
        cache
            .get_or_fetch(&request.description_link, self.collaborators.descriptions.as_ref())
            .await
            .map_err(|e| match e {
                CollaboratorError::NotFound(link) => {
                    ReservationError::Validation(format!("unknown resource description {link}"))
                }
                other => ReservationError::CollaboratorUnavailable(other.to_string()),
            })?;

        let task_id = self.next_task_id(&request.description_link);
        let body = ReservationBody::new(request, &task_id, cache);
        info!(
            task_id = %task_id,
            description = %body.description_link,
            count = body.resource_count,
            tenants = ?body.tenant_scope.links(),
            "reservation submitted"
        );
        Ok(self.runtime.start(task_id, body, callback)?)
    }

    fn next_task_id(&self, description_link: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(description_link.as_bytes());
        hasher.update(nanos.to_be_bytes());
        hasher.update(seq.to_be_bytes());
        let digest = hasher.finalize();
        format!("reservation-{}", &hex::encode(digest)[..12])
    }
}

/// Wait for `handle` to finish, forcing a failure once `deadline` elapses.
pub async fn supervise(
    handle: &TaskHandle<ReservationTask>,
    deadline: Duration,
) -> TaskDocument<ReservationTask> {
    tokio::select! {
        doc = handle.wait_terminal() => doc,
        _ = tokio::time::sleep(deadline) => {
            warn!(
                task_id = %handle.task_id(),
                deadline_secs = deadline.as_secs(),
                "reservation deadline elapsed"
            );
            let forced = ReservationError::CollaboratorUnavailable("deadline elapsed".to_string());
            if handle.fail(forced).is_err() {
                warn!(task_id = %handle.task_id(), "task gone before forced failure");
            }
            handle.wait_terminal().await
        }
    }
}
