pub mod diagnostics;
mod pool;
mod report;
mod store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Level as LogLevel;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::ExecutorConfig;
use crate::error::{ExecuteError, TaskFailure};
use crate::merge::{Mergeable, Outcome, merge_with_rule};
use crate::operator::Operator;
use crate::plan::{ExecutionPlan, Level};
use crate::task::{Task, TaskId};

use self::pool::{Finished, Unit, execute_unit, run_pooled};

pub use self::report::{ExecutionReport, LevelTiming, Metrics, Primary};
pub use self::store::{ResultStore, TaskResult, Worker};

/// Runs an [`ExecutionPlan`] level by level.
///
/// Levels are strictly sequential. Inside a level every task runs on a pool
/// built for that level alone, sized to `min(pool_size, level_len)`. A level
/// holding a single task runs on the calling thread instead, unless a task
/// timeout is configured.
pub struct Executor<O: ?Sized> {
    config: ExecutorConfig,
    operator: Arc<O>,
}

impl<O> Executor<O> {
    pub fn new(operator: O) -> Self {
        Self::from_arc(Arc::new(operator))
    }
}

impl<O: ?Sized> Executor<O> {
    /// Use an operator that is already shared, e.g. an `Arc<dyn Operator<V>>`.
    pub fn from_arc(operator: Arc<O>) -> Self {
        Self {
            config: ExecutorConfig::default(),
            operator,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = Some(size);
        self
    }

    /// Limit on how long a single task may run. Rounded down to whole
    /// milliseconds.
    pub fn task_timeout(mut self, limit: Duration) -> Self {
        self.config.task_timeout_ms = Some(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Plans `tasks` and executes them against `source`.
    pub fn run<V>(
        &self,
        tasks: impl IntoIterator<Item = Task>,
        source: V,
    ) -> Result<ExecutionReport<V>, ExecuteError>
    where
        V: Mergeable + Send + Sync + 'static,
        O: Operator<V> + 'static,
    {
        let plan = ExecutionPlan::from_tasks(tasks)?;
        self.execute(&plan, source)
    }

    /// Executes every level of `plan`. Every task that fails, panics or
    /// times out is recorded in the report; only configuration and pool
    /// construction problems abort the run.
    pub fn execute<V>(
        &self,
        plan: &ExecutionPlan,
        source: V,
    ) -> Result<ExecutionReport<V>, ExecuteError>
    where
        V: Mergeable + Send + Sync + 'static,
        O: Operator<V> + 'static,
    {
        let pool_size = self.config.resolved_pool_size()?;
        self.config.task_timeout()?;

        let source = Arc::new(source);
        let mut store = ResultStore::with_capacity(plan.len());
        let mut timings = Vec::with_capacity(plan.levels().len());

        let span = tracing::span!(
            LogLevel::INFO,
            "execute",
            tasks = plan.len(),
            levels = plan.levels().len(),
            pool_size
        );
        span.pb_set_style(&crate::utils::style_run());
        span.pb_set_length(plan.levels().len() as u64);
        span.pb_set_message("Running levels...");
        let _enter = span.enter();

        let start = Instant::now();

        for level in plan.levels() {
            timings.push(self.execute_level(level, &mut store, &source)?);
            span.pb_inc(1);
        }

        let total = start.elapsed();
        let report = ExecutionReport::finalize(plan, store, timings, total, pool_size);

        tracing::info!(
            elapsed = ?total,
            speedup = report.speedup(),
            failed = report.failures().len(),
            "run complete"
        );

        Ok(report)
    }

    /// Runs a single level against the results already in `store`, then
    /// writes its results into `store`.
    ///
    /// Every dependency of the level must already have a result, which holds
    /// whenever levels are run in plan order.
    pub fn execute_level<V>(
        &self,
        level: &Level,
        store: &mut ResultStore<V>,
        source: &Arc<V>,
    ) -> Result<LevelTiming, ExecuteError>
    where
        V: Mergeable + Send + Sync + 'static,
        O: Operator<V> + 'static,
    {
        let pool_size = self.config.resolved_pool_size()?;
        let timeout = self.config.task_timeout()?;

        let span = tracing::span!(
            LogLevel::INFO,
            "level",
            index = level.index(),
            tasks = level.len()
        );
        span.pb_set_style(&crate::utils::style_level());
        span.pb_set_length(level.len() as u64);
        span.pb_set_message(&format!("Level {}", level.index()));
        let _enter = span.enter();

        let start = Instant::now();

        let units: Vec<Unit<V>> = level
            .tasks()
            .iter()
            .enumerate()
            .map(|(slot, task)| Unit {
                slot,
                task: Arc::clone(task),
                input: resolve_input(task, store, source),
            })
            .collect();

        let report_finished = |finished: &Finished<V>| {
            let task = &level.tasks()[finished.slot].id;
            match &finished.outcome {
                Ok(_) => tracing::debug!(
                    task = %task,
                    worker = %finished.worker,
                    elapsed = ?finished.duration,
                    "task finished"
                ),
                Err(failure) => tracing::warn!(
                    task = %task,
                    worker = %finished.worker,
                    "task failed: {failure}"
                ),
            }
            span.pb_inc(1);
        };

        // A timeout can only be enforced from outside the worker, so with one
        // configured even a lone task goes to a pool.
        let (finished, workers) = if units.len() == 1 && timeout.is_none() {
            let finished = execute_unit(&units[0], &*self.operator, Worker::Inline);
            report_finished(&finished);
            (vec![finished], 1)
        } else {
            let threads = pool_size.min(units.len()).max(1);
            let finished = run_pooled(
                level.index(),
                units,
                &self.operator,
                threads,
                timeout,
                report_finished,
            )?;
            (finished, threads)
        };

        for done in finished {
            store.insert(TaskResult {
                task: level.tasks()[done.slot].id.clone(),
                outcome: done.outcome,
                level: level.index(),
                slot: done.slot,
                worker: done.worker,
                start: done.start,
                duration: done.duration,
            });
        }

        let duration = start.elapsed();
        tracing::info!(elapsed = ?duration, workers, "level {} done", level.index());

        Ok(LevelTiming {
            index: level.index(),
            tasks: level.len(),
            workers,
            duration,
        })
    }
}

/// Input of a task: the source for roots, the upstream outcome for a single
/// dependency, and a merge of the upstream outcomes otherwise.
fn resolve_input<V: Mergeable>(task: &Task, store: &ResultStore<V>, source: &Arc<V>) -> Outcome<V> {
    match task.depends_on.as_slice() {
        [] => Ok(Arc::clone(source)),
        [dependency] => store
            .outcome(dependency)
            .cloned()
            .unwrap_or_else(|| Err(missing(dependency))),
        dependencies => {
            let mut outcomes = Vec::with_capacity(dependencies.len());
            for dependency in dependencies {
                match store.outcome(dependency) {
                    Some(outcome) => outcomes.push(outcome),
                    None => return Err(missing(dependency)),
                }
            }

            let (input, rule) = merge_with_rule(&outcomes);
            tracing::debug!(task = %task.id, ?rule, "merged dependency outputs");
            input
        }
    }
}

fn missing(dependency: &TaskId) -> TaskFailure {
    TaskFailure::new(format!("No result recorded for dependency '{dependency}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    use serde::Serialize;

    use crate::error::{ConfigError, PlanError};
    use crate::merge::Shape;
    use crate::operator::Input;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Rows(Vec<u32>);

    impl Mergeable for Rows {
        fn shape(&self) -> Shape {
            Shape::Table
        }

        fn intersect(inputs: &[&Self]) -> Option<Self> {
            let (first, rest) = inputs.split_first()?;
            let rows = first
                .0
                .iter()
                .copied()
                .filter(|row| rest.iter().all(|other| other.0.contains(row)))
                .collect();
            Some(Rows(rows))
        }
    }

    fn source() -> Rows {
        Rows((0..10).collect())
    }

    fn keep(rows: &Rows, predicate: impl Fn(u32) -> bool) -> Rows {
        Rows(rows.0.iter().copied().filter(|&row| predicate(row)).collect())
    }

    /// Picks its behaviour from the task id prefix.
    fn step(task: &Task, input: Input<'_, Rows>) -> anyhow::Result<Rows> {
        let rows = input.map_err(|failure| anyhow::anyhow!("Upstream failed: {failure}"))?;

        match task.id.as_str() {
            id if id.starts_with("fail") => anyhow::bail!("Error: {id} refused"),
            id if id.starts_with("panic") => panic!("{id} exploded"),
            id if id.starts_with("stall") => {
                sleep(Duration::from_millis(400));
                Ok(rows.clone())
            }
            id if id.starts_with("even") => Ok(keep(rows, |row| row % 2 == 0)),
            id if id.starts_with("small") => Ok(keep(rows, |row| row < 6)),
            id if id.starts_with("slow") => {
                sleep(Duration::from_millis(20));
                Ok(rows.clone())
            }
            _ => Ok(rows.clone()),
        }
    }

    fn executor(pool: usize) -> Executor<fn(&Task, Input<'_, Rows>) -> anyhow::Result<Rows>> {
        Executor::new(step as fn(&Task, Input<'_, Rows>) -> anyhow::Result<Rows>).pool_size(pool)
    }

    fn message(report: &ExecutionReport<Rows>, id: &str) -> String {
        report
            .result(&id.into())
            .and_then(TaskResult::failure)
            .map(|failure| failure.message().to_owned())
            .unwrap_or_default()
    }

    fn value<'a>(report: &'a ExecutionReport<Rows>, id: &str) -> Option<&'a Rows> {
        report.result(&id.into()).and_then(TaskResult::value)
    }

    #[test]
    fn test_linear_chain_runs_inline() {
        let tasks = [
            Task::fetch("T1"),
            Task::fetch("even").depends_on("T1"),
            Task::fetch("small").depends_on("even"),
        ];
        let report = executor(4).run(tasks, source()).unwrap();

        assert_eq!(report.levels().len(), 3);
        assert!(report.levels().iter().all(|level| level.workers == 1));
        assert!(report.results().all(|result| result.worker == Worker::Inline));

        let Some(Primary::Single(result)) = report.primary() else {
            panic!("expected a single final result");
        };
        assert_eq!(result.value(), Some(&Rows(vec![0, 2, 4])));
    }

    #[test]
    fn test_fan_in_intersects() {
        let tasks = [
            Task::fetch("even"),
            Task::fetch("small"),
            Task::fetch("T3").depends_on_all(["even", "small"]),
        ];
        let report = executor(4).run(tasks, source()).unwrap();

        assert_eq!(value(&report, "T3"), Some(&Rows(vec![0, 2, 4])));
        assert_eq!(report.levels()[0].workers, 2);

        let first = report.result(&"even".into()).unwrap();
        assert!(matches!(first.worker, Worker::Pool(_)));
        assert_eq!(first.level, 0);
        assert_eq!(first.slot, 0);
    }

    #[test]
    fn test_failure_is_contained_and_poisons_forward() {
        let tasks = [
            Task::fetch("fail"),
            Task::fetch("T2"),
            Task::fetch("T3").depends_on("fail"),
        ];
        let report = executor(2).run(tasks, source()).unwrap();

        assert_eq!(message(&report, "fail"), "Error: fail refused");
        assert_eq!(value(&report, "T2"), Some(&source()));
        assert_eq!(
            message(&report, "T3"),
            "Upstream failed: Error: fail refused"
        );
        assert_eq!(
            report.failures(),
            [&TaskId::from("fail"), &TaskId::from("T3")]
        );
        assert!(!report.is_success());
    }

    #[test]
    fn test_mixed_fan_in_takes_first_success() {
        let tasks = [
            Task::fetch("fail"),
            Task::fetch("even"),
            Task::fetch("T3").depends_on_all(["fail", "even"]),
        ];
        let report = executor(2).run(tasks, source()).unwrap();

        assert_eq!(value(&report, "T3"), Some(&Rows(vec![0, 2, 4, 6, 8])));
    }

    #[test]
    fn test_failed_fan_in_combines_messages() {
        let tasks = [
            Task::fetch("fail_a"),
            Task::fetch("fail_b"),
            Task::fetch("T3").depends_on_all(["fail_a", "fail_b"]),
        ];
        let report = executor(2).run(tasks, source()).unwrap();

        assert_eq!(
            message(&report, "T3"),
            "Upstream failed: Error: fail_a refused; Error: fail_b refused"
        );
    }

    #[test]
    fn test_panic_is_contained() {
        let tasks = [Task::fetch("panic"), Task::fetch("T2")];
        let report = executor(2).run(tasks, source()).unwrap();

        assert_eq!(message(&report, "panic"), "Task panicked: panic exploded");
        assert!(value(&report, "T2").is_some());
    }

    #[test]
    fn test_pool_is_sized_per_level() {
        let tasks = (0..6)
            .map(|n| Task::fetch(format!("slow{n}")))
            .chain([Task::fetch("last").depends_on_all((0..6).map(|n| format!("slow{n}")))]);
        let report = executor(2).run(tasks, source()).unwrap();

        assert_eq!(report.levels()[0].tasks, 6);
        assert_eq!(report.levels()[0].workers, 2);
        assert_eq!(report.levels()[1].workers, 1);

        let workers: Vec<Worker> = report
            .results()
            .filter(|result| result.level == 0)
            .map(|result| result.worker)
            .collect();
        assert!(
            workers
                .iter()
                .all(|worker| matches!(worker, Worker::Pool(0 | 1)))
        );
    }

    #[test]
    fn test_pool_size_does_not_change_results() {
        let tasks = || {
            [
                Task::fetch("even"),
                Task::fetch("small"),
                Task::fetch("fail"),
                Task::fetch("both").depends_on_all(["even", "small"]),
                Task::fetch("after").depends_on("fail"),
                Task::fetch("slow").depends_on("both"),
            ]
        };

        let serial = executor(1).run(tasks(), source()).unwrap();
        let parallel = executor(4).run(tasks(), source()).unwrap();

        assert_eq!(serial.fingerprint().unwrap(), parallel.fingerprint().unwrap());
        for result in serial.results() {
            let other = parallel.result(&result.task).unwrap();
            assert_eq!(result.outcome, other.outcome);
        }
    }

    #[test]
    fn test_metrics_identities() {
        let tasks = (0..4).map(|n| Task::fetch(format!("slow{n}")));
        let report = executor(4).run(tasks, source()).unwrap();

        let sequential = report.sequential_time().as_secs_f64();
        let total = report.total_duration().as_secs_f64();
        assert!(total > 0.0);
        assert!((report.speedup() - sequential / total).abs() < 1e-9);
        assert!((report.efficiency() - report.speedup() / 4.0).abs() < 1e-9);
        assert!(report.total_duration() >= report.levels()[0].duration);
    }

    #[test]
    fn test_timeout_applies_to_single_task_level() {
        let tasks = [Task::fetch("stall"), Task::fetch("T2").depends_on("stall")];
        let started = Instant::now();
        let report = executor(2)
            .task_timeout(Duration::from_millis(50))
            .run(tasks, source())
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(350));
        assert!(message(&report, "stall").starts_with("Task timed out after"));
        assert!(message(&report, "T2").starts_with("Upstream failed: Task timed out"));
        assert_eq!(
            report.result(&"stall".into()).unwrap().worker,
            Worker::Pool(0)
        );
    }

    #[test]
    fn test_rejects_bad_config() {
        let err = executor(0).run([Task::fetch("T1")], source()).unwrap_err();
        assert!(matches!(err, ExecuteError::Config(ConfigError::ZeroPoolSize)));

        let err = executor(1)
            .task_timeout(Duration::from_micros(10))
            .run([Task::fetch("T1")], source())
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Config(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn test_plan_errors_stop_the_run() {
        let tasks = [
            Task::fetch("T1").depends_on("T2"),
            Task::fetch("T2").depends_on("T1"),
        ];
        let err = executor(2).run(tasks, source()).unwrap_err();
        assert!(matches!(err, ExecuteError::Plan(PlanError::CycleDetected(_))));
    }

    #[test]
    fn test_empty_plan() {
        let report = executor(2).run(Vec::new(), source()).unwrap();
        assert!(report.primary().is_none());
        assert!(report.levels().is_empty());
    }

    #[test]
    fn test_shared_operator() {
        let operator: Arc<dyn Operator<Rows>> = Arc::new(step);
        let report = Executor::from_arc(operator)
            .pool_size(2)
            .run([Task::fetch("even")], source())
            .unwrap();
        assert_eq!(value(&report, "even"), Some(&Rows(vec![0, 2, 4, 6, 8])));
    }
}
