use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::Serialize;

use crate::core::Hash32;
use crate::executor::store::{ResultStore, TaskResult};
use crate::plan::ExecutionPlan;
use crate::task::TaskId;

/// Timing of one level, barrier to barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelTiming {
    pub index: usize,
    pub tasks: usize,
    /// Workers the level actually used, never more than its task count.
    pub workers: usize,
    pub duration: Duration,
}

/// The output of a run as seen by a consumer: one value when the last level
/// has a single task, otherwise every result of the last level by id.
#[derive(Debug)]
pub enum Primary<'a, V> {
    Single(&'a TaskResult<V>),
    Many(BTreeMap<&'a TaskId, &'a TaskResult<V>>),
}

/// Derived performance figures of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub tasks: usize,
    pub levels: usize,
    pub pool_size: usize,
    pub total_seconds: f64,
    /// Sum of every task's own duration, what a single worker would need.
    pub sequential_seconds: f64,
    pub speedup: f64,
    pub efficiency: f64,
}

impl Display for Metrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} tasks in {} levels, pool size {}",
            self.tasks, self.levels, self.pool_size
        )?;
        writeln!(f, "Total time:      {:.4}s", self.total_seconds)?;
        writeln!(f, "Sequential time: {:.4}s", self.sequential_seconds)?;
        writeln!(f, "Speedup:         {:.2}x", self.speedup)?;
        write!(f, "Efficiency:      {:.1}%", self.efficiency * 100.0)
    }
}

/// Everything a run produced. Built once, after the last level, and never
/// modified afterwards.
#[derive(Debug)]
pub struct ExecutionReport<V> {
    results: HashMap<TaskId, TaskResult<V>>,
    /// Task ids in plan order.
    order: Vec<TaskId>,
    final_ids: Vec<TaskId>,
    levels: Vec<LevelTiming>,
    total_duration: Duration,
    pool_size: usize,
}

impl<V> ExecutionReport<V> {
    pub fn finalize(
        plan: &ExecutionPlan,
        store: ResultStore<V>,
        levels: Vec<LevelTiming>,
        total_duration: Duration,
        pool_size: usize,
    ) -> Self {
        let order = plan
            .levels()
            .iter()
            .flat_map(|level| level.ids().cloned())
            .collect();

        let final_ids = plan
            .final_level()
            .map(|level| level.ids().cloned().collect())
            .unwrap_or_default();

        Self {
            results: store.into_inner(),
            order,
            final_ids,
            levels,
            total_duration,
            pool_size,
        }
    }

    pub fn result(&self, id: &TaskId) -> Option<&TaskResult<V>> {
        self.results.get(id)
    }

    /// Every recorded result, in plan order.
    pub fn results(&self) -> impl Iterator<Item = &TaskResult<V>> {
        self.order.iter().filter_map(|id| self.results.get(id))
    }

    /// Results of the last level, in plan order.
    pub fn final_results(&self) -> Vec<&TaskResult<V>> {
        self.final_ids
            .iter()
            .filter_map(|id| self.results.get(id))
            .collect()
    }

    /// `None` only for an empty plan.
    pub fn primary(&self) -> Option<Primary<'_, V>> {
        match self.final_results().as_slice() {
            [] => None,
            [single] => Some(Primary::Single(single)),
            many => Some(Primary::Many(
                many.iter().map(|result| (&result.task, *result)).collect(),
            )),
        }
    }

    /// Ids of the failed tasks, in plan order.
    pub fn failures(&self) -> Vec<&TaskId> {
        self.results()
            .filter(|result| !result.is_success())
            .map(|result| &result.task)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.results().all(TaskResult::is_success)
    }

    pub fn levels(&self) -> &[LevelTiming] {
        &self.levels
    }

    pub fn level_durations(&self) -> Vec<Duration> {
        self.levels.iter().map(|level| level.duration).collect()
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn sequential_time(&self) -> Duration {
        self.results.values().map(|result| result.duration).sum()
    }

    /// Sequential time over wall-clock time. Zero if the run took no
    /// measurable time.
    pub fn speedup(&self) -> f64 {
        let total = self.total_duration.as_secs_f64();
        if total == 0.0 {
            return 0.0;
        }

        self.sequential_time().as_secs_f64() / total
    }

    pub fn efficiency(&self) -> f64 {
        self.speedup() / self.pool_size as f64
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            tasks: self.order.len(),
            levels: self.levels.len(),
            pool_size: self.pool_size,
            total_seconds: self.total_duration.as_secs_f64(),
            sequential_seconds: self.sequential_time().as_secs_f64(),
            speedup: self.speedup(),
            efficiency: self.efficiency(),
        }
    }
}

impl<V: Serialize> ExecutionReport<V> {
    /// Hash of the final results' content, in plan order. Timings are not
    /// included, so two runs that computed the same values agree.
    pub fn fingerprint(&self) -> serde_json::Result<Hash32> {
        let mut hasher = blake3::Hasher::new();

        for result in self.final_results() {
            hasher.update(result.task.as_str().as_bytes());
            hasher.update(&[0]);

            match &result.outcome {
                Ok(value) => {
                    hasher.update(b"ok:");
                    serde_json::to_writer(&mut hasher, value.as_ref())?;
                }
                Err(failure) => {
                    hasher.update(b"err:");
                    hasher.update(failure.message().as_bytes());
                }
            }

            hasher.update(&[0xff]);
        }

        Ok(hasher.finalize().into())
    }
}
