//! Data-driven stage dispatch: a map from substage to handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::runtime::TaskHandle;
use crate::stage::{TaskDocument, TaskKind};

/// Body mutation applied together with a substage change.
pub type Mutator<T> = Box<dyn FnOnce(&mut <T as TaskKind>::Body) + Send>;

/// Move to a substage, optionally mutating the body in the same step.
pub struct Transition<T: TaskKind> {
    pub to: T::SubStage,
    pub mutate: Option<Mutator<T>>,
}

impl<T: TaskKind> Transition<T> {
    pub fn to(to: T::SubStage) -> Self {
        Self { to, mutate: None }
    }

    pub fn with<F>(mut self, mutate: F) -> Self
    where
        F: FnOnce(&mut T::Body) + Send + 'static,
    {
        self.mutate = Some(Box::new(mutate));
        self
    }
}

impl<T: TaskKind> std::fmt::Debug for Transition<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("to", &self.to)
            .field("mutates", &self.mutate.is_some())
            .finish()
    }
}

/// What a stage handler asks the runtime to do next.
pub enum StepOutcome<T: TaskKind> {
    /// Apply the transition and run the handler of the new substage.
    Proceed(Transition<T>),
    /// Wait for an external event on the task's mailbox.
    Suspend,
    /// Move to the error substage.
    Fail(T::Error),
}

impl<T: TaskKind> StepOutcome<T> {
    pub fn proceed(to: T::SubStage) -> Self {
        StepOutcome::Proceed(Transition::to(to))
    }
}

/// Input of a stage handler.
pub struct StageContext<T: TaskKind> {
    /// Snapshot of the task when the handler started.
    pub document: TaskDocument<T>,
    /// Mailbox of the same task, for events delivered later.
    pub handle: TaskHandle<T>,
}

impl<T: TaskKind> StageContext<T> {
    pub fn body(&self) -> &T::Body {
        &self.document.body
    }

    pub fn task_id(&self) -> &str {
        &self.document.task_id
    }
}

type Handler<T, S> =
    Arc<dyn Fn(Arc<S>, StageContext<T>) -> BoxFuture<'static, StepOutcome<T>> + Send + Sync>;

/// Handlers keyed by substage. Substages without a handler suspend the
/// task until an event arrives.
pub struct StageTable<T: TaskKind, S> {
    handlers: HashMap<T::SubStage, Handler<T, S>>,
}

impl<T: TaskKind, S: Send + Sync + 'static> StageTable<T, S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `stage`, replacing any previous one.
    pub fn on<F, Fut>(mut self, stage: T::SubStage, handler: F) -> Self
    where
        F: Fn(Arc<S>, StageContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutcome<T>> + Send + 'static,
    {
        let handler: Handler<T, S> = Arc::new(move |services, ctx| handler(services, ctx).boxed());
        self.handlers.insert(stage, handler);
        self
    }

    pub fn handles(&self, stage: T::SubStage) -> bool {
        self.handlers.contains_key(&stage)
    }

    pub(crate) fn handler(&self, stage: T::SubStage) -> Option<Handler<T, S>> {
        self.handlers.get(&stage).cloned()
    }
}

impl<T: TaskKind, S: Send + Sync + 'static> Default for StageTable<T, S> {
    fn default() -> Self {
        Self::new()
    }
}
