//! Stage and substage model shared by every task kind.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a task, derived from its substage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Created,
    Started,
    Finished,
    Failed,
}

impl TaskStage {
    pub fn of<S: SubStage>(sub_stage: S) -> Self {
        if sub_stage == S::COMPLETED {
            TaskStage::Finished
        } else if sub_stage == S::ERROR {
            TaskStage::Failed
        } else if sub_stage == S::INITIAL {
            TaskStage::Created
        } else {
            TaskStage::Started
        }
    }
}

/// Position of a task inside its state machine.
///
/// The `Ord` implementation is the forward direction of the machine:
/// a task never moves to a smaller substage.
pub trait SubStage:
    Copy + Eq + Ord + Hash + Debug + Serialize + Send + Sync + 'static
{
    const INITIAL: Self;
    const COMPLETED: Self;
    const ERROR: Self;

    fn is_terminal(self) -> bool {
        self == Self::COMPLETED || self == Self::ERROR
    }

    /// Whether a task at `self` may move to `next`. Re-entering the same
    /// substage is allowed (retry loops).
    fn accepts(self, next: Self) -> bool {
        !self.is_terminal() && next >= self
    }
}

/// Static description of a task kind: its substages, working state, result
/// and failure types.
pub trait TaskKind: Send + Sync + 'static {
    /// Name used in logs and journaled documents.
    const KIND: &'static str;

    type SubStage: SubStage;
    type Body: Clone + Debug + Serialize + Send + Sync + 'static;
    type Output: Clone + Debug + Serialize + Send + Sync + 'static;
    type Error: Clone + Debug + Display + Serialize + Send + Sync + 'static;

    /// Reject a body before the task is created.
    fn validate(body: &Self::Body) -> Result<(), String>;

    /// Result delivered to the caller once the task completes.
    fn output(body: &Self::Body) -> Self::Output;
}

/// Introspectable snapshot of a running task.
#[derive(Serialize)]
#[serde(bound(serialize = ""))]
pub struct TaskDocument<T: TaskKind> {
    pub task_id: String,
    pub kind: &'static str,
    pub stage: TaskStage,
    pub sub_stage: T::SubStage,
    /// Incremented on every applied transition.
    pub version: u64,
    pub body: T::Body,
    pub failure: Option<T::Error>,
}

impl<T: TaskKind> TaskDocument<T> {
    pub fn new(task_id: String, body: T::Body) -> Self {
        Self {
            task_id,
            kind: T::KIND,
            stage: TaskStage::Created,
            sub_stage: T::SubStage::INITIAL,
            version: 0,
            body,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sub_stage.is_terminal()
    }
}

impl<T: TaskKind> Clone for TaskDocument<T> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id.clone(),
            kind: self.kind,
            stage: self.stage,
            sub_stage: self.sub_stage,
            version: self.version,
            body: self.body.clone(),
            failure: self.failure.clone(),
        }
    }
}

impl<T: TaskKind> Debug for TaskDocument<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDocument")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("stage", &self.stage)
            .field("sub_stage", &self.sub_stage)
            .field("version", &self.version)
            .field("body", &self.body)
            .field("failure", &self.failure)
            .finish()
    }
}
