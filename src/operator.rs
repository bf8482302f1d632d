use crate::error::TaskFailure;
use crate::task::Task;

/// The input handed to an operator: the resolved upstream value, or the
/// failure that upstream produced. Failed inputs are passed on rather than
/// skipped so that the operator decides what an error-shaped input means.
pub type Input<'a, V> = Result<&'a V, &'a TaskFailure>;

/// The capability that actually performs a task.
///
/// It is invoked exactly once per task, possibly from several worker threads
/// at the same time, each with its own input. An `Err` (or a panic) becomes
/// an error-valued result for that task only.
pub trait Operator<V>: Send + Sync {
    fn apply(&self, task: &Task, input: Input<'_, V>) -> anyhow::Result<V>;
}

impl<V, F> Operator<V> for F
where
    F: Fn(&Task, Input<'_, V>) -> anyhow::Result<V> + Send + Sync,
{
    fn apply(&self, task: &Task, input: Input<'_, V>) -> anyhow::Result<V> {
        self(task, input)
    }
}
