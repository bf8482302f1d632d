use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

/// Errors raised while turning a task list into an [`ExecutionPlan`].
///
/// All of these are fatal: no task runs when planning fails.
///
/// [`ExecutionPlan`]: crate::ExecutionPlan
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(TaskId),

    #[error("Cycle detected in task dependencies: {}", display_ids(.0))]
    CycleDetected(Vec<TaskId>),
}

fn display_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Worker pool size must be at least 1")]
    ZeroPoolSize,

    #[error("Task timeout must be longer than zero")]
    ZeroTimeout,
}

/// Errors that can stop [`Executor::execute`] before it produces a report.
///
/// [`Executor::execute`]: crate::Executor::execute
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// The error half of a task outcome.
///
/// Produced when the operator returns an error, panics, times out, or when a
/// task receives nothing but failed inputs. Failures are plain data so they
/// can be passed downstream as an input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TaskFailure {
    message: String,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub(crate) fn from_operator(err: &anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        Self::new(format!("{err:#}"))
    }

    pub(crate) fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
            format!("Task panicked: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            format!("Task panicked: {s}")
        } else {
            String::from("Task panicked with unknown payload")
        };

        Self::new(msg)
    }

    pub(crate) fn timed_out(after: Duration) -> Self {
        Self::new(format!("Task timed out after {after:.2?}"))
    }

    pub(crate) fn starved() -> Self {
        Self::new("Task never started: every worker is held by a timed out task")
    }

    /// Joins several failures into one, keeping their order.
    pub(crate) fn combine<'a>(failures: impl IntoIterator<Item = &'a TaskFailure>) -> Self {
        let message = failures
            .into_iter()
            .map(|failure| failure.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        Self::new(message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
