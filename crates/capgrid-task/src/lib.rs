//! capgrid-task — generic runtime for multi-stage tasks.
//!
//! A task kind declares its substages, body, output and error types
//! ([`TaskKind`]) and registers one async handler per substage in a
//! [`StageTable`]. [`TaskRuntime::start`] spawns an instance that walks the
//! table: each handler returns the next transition, suspends until an
//! external event arrives, or fails the task. Terminal substages notify the
//! caller's [`TaskCallback`] exactly once.

pub mod error;
pub mod runtime;
pub mod stage;
pub mod table;

pub use error::{TaskError, TaskResult};
pub use runtime::{TaskCallback, TaskCompletion, TaskEvent, TaskHandle, TaskRuntime};
pub use stage::{SubStage, TaskDocument, TaskKind, TaskStage};
pub use table::{Mutator, StageContext, StageTable, StepOutcome, Transition};
