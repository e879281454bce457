//! Task runtime — one tokio task per task instance.
//!
//! Each instance owns its document and processes one event at a time from
//! an unbounded mailbox, so its state is never touched concurrently. Stage
//! handlers run inside the instance; events posted while a handler runs
//! queue behind it. Every applied transition bumps the document version,
//! is published on a watch channel and, when a journal is configured,
//! persisted to the state store. The caller callback fires once, when the
//! task first reaches a terminal substage.

use std::sync::Arc;

use capgrid_state::StateStore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::stage::{SubStage, TaskDocument, TaskKind, TaskStage};
use crate::table::{StageContext, StageTable, StepOutcome, Transition};

// ── Events and callbacks ───────────────────────────────────────────

/// An event delivered to a task's mailbox.
pub enum TaskEvent<T: TaskKind> {
    Patch(Transition<T>),
    Fail(T::Error),
}

/// Terminal notification delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCompletion<O, E> {
    Finished { task_id: String, output: O },
    Failed { task_id: String, error: E },
}

impl<O, E> TaskCompletion<O, E> {
    pub fn task_id(&self) -> &str {
        match self {
            TaskCompletion::Finished { task_id, .. } | TaskCompletion::Failed { task_id, .. } => {
                task_id
            }
        }
    }
}

/// Receiver of a task's terminal notification.
pub trait TaskCallback<T: TaskKind>: Send + Sync + 'static {
    fn on_terminal(&self, completion: TaskCompletion<T::Output, T::Error>);
}

impl<T: TaskKind> TaskCallback<T> for mpsc::UnboundedSender<TaskCompletion<T::Output, T::Error>> {
    fn on_terminal(&self, completion: TaskCompletion<T::Output, T::Error>) {
        if self.send(completion).is_err() {
            debug!(kind = T::KIND, "completion receiver dropped");
        }
    }
}

// ── Handle ─────────────────────────────────────────────────────────

/// Sends events to one task instance and observes its document.
pub struct TaskHandle<T: TaskKind> {
    task_id: String,
    tx: mpsc::UnboundedSender<TaskEvent<T>>,
    snapshot: watch::Receiver<TaskDocument<T>>,
}

impl<T: TaskKind> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id.clone(),
            tx: self.tx.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<T: TaskKind> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl<T: TaskKind> TaskHandle<T> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Ask the task to move to another substage.
    pub fn patch(&self, transition: Transition<T>) -> TaskResult<()> {
        self.tx
            .send(TaskEvent::Patch(transition))
            .map_err(|_| TaskError::Closed(self.task_id.clone()))
    }

    /// Force the task into its error substage.
    pub fn fail(&self, error: T::Error) -> TaskResult<()> {
        self.tx
            .send(TaskEvent::Fail(error))
            .map_err(|_| TaskError::Closed(self.task_id.clone()))
    }

    pub fn snapshot(&self) -> TaskDocument<T> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskDocument<T>> {
        self.snapshot.clone()
    }

    /// Wait until the task reaches a terminal substage.
    pub async fn wait_terminal(&self) -> TaskDocument<T> {
        let mut rx = self.snapshot.clone();
        if let Ok(doc) = rx.wait_for(|doc| doc.is_terminal()).await {
            return doc.clone();
        }
        // Instance gone without a terminal snapshot; report the last one.
        rx.borrow().clone()
    }
}

// ── Runtime ────────────────────────────────────────────────────────

/// Starts task instances of one kind over a shared stage table.
pub struct TaskRuntime<T: TaskKind, S> {
    table: Arc<StageTable<T, S>>,
    services: Arc<S>,
    journal: Option<StateStore>,
}

impl<T: TaskKind, S> Clone for TaskRuntime<T, S> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            services: self.services.clone(),
            journal: self.journal.clone(),
        }
    }
}

impl<T: TaskKind, S: Send + Sync + 'static> TaskRuntime<T, S> {
    pub fn new(table: StageTable<T, S>, services: Arc<S>) -> Self {
        Self {
            table: Arc::new(table),
            services,
            journal: None,
        }
    }

    /// Persist every applied transition to `store`.
    pub fn with_journal(mut self, store: StateStore) -> Self {
        self.journal = Some(store);
        self
    }

    /// Validate `body` and spawn a new task instance at its initial substage.
    pub fn start(
        &self,
        task_id: String,
        body: T::Body,
        callback: Arc<dyn TaskCallback<T>>,
    ) -> TaskResult<TaskHandle<T>> {
        T::validate(&body).map_err(TaskError::Validation)?;

        let document = TaskDocument::<T>::new(task_id.clone(), body);
        let (tx, rx) = mpsc::unbounded_channel();
        let (watch_tx, watch_rx) = watch::channel(document.clone());
        let handle = TaskHandle {
            task_id: task_id.clone(),
            tx,
            snapshot: watch_rx,
        };

        let instance = Instance {
            document,
            table: self.table.clone(),
            services: self.services.clone(),
            journal: self.journal.clone(),
            self_handle: Some(handle.clone()),
            watch_tx,
            callback: Some(callback),
        };
        debug!(task_id = %task_id, kind = T::KIND, "task created");
        tokio::spawn(instance.run(rx));
        Ok(handle)
    }
}

struct Instance<T: TaskKind, S> {
    document: TaskDocument<T>,
    table: Arc<StageTable<T, S>>,
    services: Arc<S>,
    journal: Option<StateStore>,
    /// Dropped on terminal so the mailbox closes with the last outside handle.
    self_handle: Option<TaskHandle<T>>,
    watch_tx: watch::Sender<TaskDocument<T>>,
    callback: Option<Arc<dyn TaskCallback<T>>>,
}

impl<T: TaskKind, S: Send + Sync + 'static> Instance<T, S> {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<TaskEvent<T>>) {
        self.journal();
        let mut next = self.run_handler().await;
        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match mailbox.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            if self.apply(event) && !self.document.is_terminal() {
                next = self.run_handler().await;
            }
        }
        debug!(task_id = %self.document.task_id, "task mailbox closed");
    }

    async fn run_handler(&self) -> Option<TaskEvent<T>> {
        let handler = self.table.handler(self.document.sub_stage)?;
        let handle = self.self_handle.clone()?;
        let ctx = StageContext {
            document: self.document.clone(),
            handle,
        };
        match handler(self.services.clone(), ctx).await {
            StepOutcome::Proceed(transition) => Some(TaskEvent::Patch(transition)),
            StepOutcome::Fail(error) => Some(TaskEvent::Fail(error)),
            StepOutcome::Suspend => None,
        }
    }

    /// Apply one event. Returns whether the document changed.
    fn apply(&mut self, event: TaskEvent<T>) -> bool {
        let task_id = self.document.task_id.clone();
        let current = self.document.sub_stage;
        if current.is_terminal() {
            debug!(task_id = %task_id, sub_stage = ?current, "event after terminal ignored");
            return false;
        }

        match event {
            TaskEvent::Patch(transition) => {
                let to = transition.to;
                if to == T::SubStage::ERROR || !current.accepts(to) {
                    warn!(
                        task_id = %task_id,
                        from = ?current,
                        to = ?to,
                        "transition rejected"
                    );
                    return false;
                }
                if let Some(mutate) = transition.mutate {
                    mutate(&mut self.document.body);
                }
                self.document.sub_stage = to;
                debug!(
                    task_id = %task_id,
                    kind = T::KIND,
                    from = ?current,
                    to = ?to,
                    "substage transition"
                );
            }
            TaskEvent::Fail(error) => {
                warn!(task_id = %task_id, kind = T::KIND, from = ?current, %error, "task failed");
                self.document.failure = Some(error);
                self.document.sub_stage = T::SubStage::ERROR;
            }
        }

        self.document.version += 1;
        self.document.stage = TaskStage::of(self.document.sub_stage);
        self.watch_tx.send_replace(self.document.clone());
        self.journal();
        if self.document.is_terminal() {
            self.complete();
        }
        true
    }

    fn complete(&mut self) {
        self.self_handle = None;
        let Some(callback) = self.callback.take() else {
            return;
        };
        let task_id = self.document.task_id.clone();
        let completion = match &self.document.failure {
            Some(error) => TaskCompletion::Failed {
                task_id: task_id.clone(),
                error: error.clone(),
            },
            None => TaskCompletion::Finished {
                task_id: task_id.clone(),
                output: T::output(&self.document.body),
            },
        };
        info!(
            task_id = %task_id,
            kind = T::KIND,
            stage = ?self.document.stage,
            version = self.document.version,
            "task terminal"
        );
        callback.on_terminal(completion);
    }

    fn journal(&self) {
        let Some(store) = &self.journal else {
            return;
        };
        let result = serde_json::to_value(&self.document)
            .map_err(|e| e.to_string())
            .and_then(|doc| {
                store
                    .put_task_document(&self.document.task_id, &doc)
                    .map_err(|e| e.to_string())
            });
        if let Err(error) = result {
            warn!(task_id = %self.document.task_id, %error, "failed to journal task document");
        }
    }
}
