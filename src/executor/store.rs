use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::TaskFailure;
use crate::merge::Outcome;
use crate::task::TaskId;

/// Where a task ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Worker {
    /// On the coordinating thread, without a pool.
    Inline,
    /// On the pool thread with this index.
    Pool(usize),
    /// The task never started.
    Unassigned,
}

impl Display for Worker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Worker::Inline => f.write_str("inline"),
            Worker::Pool(index) => write!(f, "worker-{index}"),
            Worker::Unassigned => f.write_str("unassigned"),
        }
    }
}

/// The recorded result of one task.
#[derive(Debug)]
pub struct TaskResult<V> {
    pub task: TaskId,
    pub outcome: Outcome<V>,
    /// Level the task belonged to.
    pub level: usize,
    /// Position of the task within its level.
    pub slot: usize,
    pub worker: Worker,
    pub start: Instant,
    pub duration: Duration,
}

impl<V> TaskResult<V> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&V> {
        self.outcome.as_ref().ok().map(Arc::as_ref)
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.outcome.as_ref().err()
    }
}

impl<V> Clone for TaskResult<V> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            outcome: self.outcome.clone(),
            level: self.level,
            slot: self.slot,
            worker: self.worker,
            start: self.start,
            duration: self.duration,
        }
    }
}

/// Results of one run, keyed by task id.
///
/// The store is append-only: once a task's result is written it is never
/// replaced. It is only ever written by the coordinating thread, between
/// level barriers.
#[derive(Debug)]
pub struct ResultStore<V> {
    results: HashMap<TaskId, TaskResult<V>>,
}

impl<V> ResultStore<V> {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            results: HashMap::with_capacity(capacity),
        }
    }

    /// Records a result. Returns `false`, leaving the store untouched, if the
    /// task already has one.
    pub fn insert(&mut self, result: TaskResult<V>) -> bool {
        match self.results.entry(result.task.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(task = %result.task, "ignoring second result for task");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(result);
                true
            }
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskResult<V>> {
        self.results.get(id)
    }

    pub fn outcome(&self, id: &TaskId) -> Option<&Outcome<V>> {
        self.results.get(id).map(|result| &result.outcome)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.results.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskId, &TaskResult<V>)> {
        self.results.iter()
    }

    pub(crate) fn into_inner(self) -> HashMap<TaskId, TaskResult<V>> {
        self.results
    }
}

impl<V> Default for ResultStore<V> {
    fn default() -> Self {
        Self::new()
    }
}
