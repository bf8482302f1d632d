//! Worker pool for a single level.
//!
//! A pool is built for one level, sized to the work it actually has, and torn
//! down once every unit has reported back. Units never share mutable state:
//! each one owns its input, and results travel back over a channel to the
//! coordinating thread, which is the only writer of the result store.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::time::{Duration, Instant};

use crate::error::TaskFailure;
use crate::executor::store::Worker;
use crate::merge::Outcome;
use crate::operator::{Input, Operator};
use crate::task::Task;

/// One task ready to run: its resolved input and its position in the level.
pub(crate) struct Unit<V> {
    pub slot: usize,
    pub task: Arc<Task>,
    pub input: Outcome<V>,
}

pub(crate) struct Finished<V> {
    pub slot: usize,
    pub outcome: Outcome<V>,
    pub worker: Worker,
    pub start: Instant,
    pub duration: Duration,
}

enum Event<V> {
    Started {
        slot: usize,
        at: Instant,
        worker: Worker,
    },
    Finished(Finished<V>),
}

/// Runs a unit on the current thread, turning errors and panics into
/// failures.
pub(crate) fn execute_unit<V, O>(unit: &Unit<V>, operator: &O, worker: Worker) -> Finished<V>
where
    O: Operator<V> + ?Sized,
{
    let input: Input<'_, V> = match &unit.input {
        Ok(value) => Ok(Arc::as_ref(value)),
        Err(failure) => Err(failure),
    };

    let start = Instant::now();

    // The operator only sees shared, immutable data, so a panic cannot leave
    // anything half-written behind.
    let outcome = match catch_unwind(AssertUnwindSafe(|| operator.apply(&unit.task, input))) {
        Ok(Ok(value)) => Ok(Arc::new(value)),
        Ok(Err(err)) => Err(TaskFailure::from_operator(&err)),
        Err(panic) => Err(TaskFailure::from_panic(panic)),
    };

    Finished {
        slot: unit.slot,
        outcome,
        worker,
        start,
        duration: start.elapsed(),
    }
}

/// Dispatches every unit to a fresh pool of `threads` workers and waits for
/// all of them. Results come back ordered by slot.
///
/// With a `timeout`, a unit that runs longer than the limit is recorded as a
/// failure and abandoned. Once every thread is held by an abandoned unit, the
/// queued units get one more timeout to start; if no thread frees up by then,
/// they are failed too.
pub(crate) fn run_pooled<V, O>(
    level: usize,
    units: Vec<Unit<V>>,
    operator: &Arc<O>,
    threads: usize,
    timeout: Option<Duration>,
    mut on_finished: impl FnMut(&Finished<V>),
) -> Result<Vec<Finished<V>>, rayon::ThreadPoolBuildError>
where
    V: Send + Sync + 'static,
    O: Operator<V> + ?Sized + 'static,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |index| format!("strata-L{level}-{index}"))
        .build()?;

    let total = units.len();
    let cancelled = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = channel::<Event<V>>();

    for unit in units {
        let sender = sender.clone();
        let operator = Arc::clone(operator);
        let cancelled = Arc::clone(&cancelled);

        pool.spawn(move || {
            if cancelled.load(Ordering::Acquire) {
                return;
            }

            let worker = rayon::current_thread_index()
                .map(Worker::Pool)
                .unwrap_or(Worker::Unassigned);

            // The receiver may already be gone if this unit was given up on.
            let _ = sender.send(Event::Started {
                slot: unit.slot,
                at: Instant::now(),
                worker,
            });
            let finished = execute_unit(&unit, &*operator, worker);
            let _ = sender.send(Event::Finished(finished));
        });
    }

    drop(sender);

    let mut collector = Collector::new(total, threads, timeout);
    collector.run(&receiver, &mut on_finished);
    cancelled.store(true, Ordering::Release);

    Ok(collector.into_results())
}

struct Collector<V> {
    results: Vec<Option<Finished<V>>>,
    running: HashMap<usize, (Instant, Worker)>,
    remaining: usize,
    threads: usize,
    /// Timed out slots whose thread has not reported back yet.
    abandoned: HashSet<usize>,
    /// When the queued units are given up on, set while every thread is held.
    starved_at: Option<Instant>,
    timeout: Option<Duration>,
}

impl<V> Collector<V> {
    fn new(total: usize, threads: usize, timeout: Option<Duration>) -> Self {
        Self {
            results: (0..total).map(|_| None).collect(),
            running: HashMap::new(),
            remaining: total,
            threads,
            abandoned: HashSet::new(),
            starved_at: None,
            timeout,
        }
    }

    fn run(&mut self, receiver: &Receiver<Event<V>>, on_finished: &mut impl FnMut(&Finished<V>)) {
        while self.remaining > 0 {
            let deadline = self.timeout.and_then(|limit| {
                self.running
                    .values()
                    .map(|&(start, _)| start + limit)
                    .chain(self.starved_at)
                    .min()
            });

            let event = match deadline {
                None => match receiver.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                Some(deadline) => {
                    match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => {
                            self.expire(Instant::now(), on_finished);
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };

            match event {
                Event::Started { slot, at, worker } => {
                    if self.results[slot].is_none() {
                        self.running.insert(slot, (at, worker));
                    }
                }
                Event::Finished(finished) => {
                    if self.results[finished.slot].is_some() {
                        // The thread is free again and will pick up queued work.
                        self.abandoned.remove(&finished.slot);
                        tracing::debug!(slot = finished.slot, "discarding late result");
                    } else {
                        self.running.remove(&finished.slot);
                        self.record(finished, on_finished);
                    }
                }
            }

            if !self.starving() {
                self.starved_at = None;
            }
        }

        // Every sender is gone but some slots never reported.
        if self.remaining > 0 {
            self.fail_unreported(
                || TaskFailure::new("Worker exited without reporting a result"),
                on_finished,
            );
        }
    }

    fn expire(&mut self, now: Instant, on_finished: &mut impl FnMut(&Finished<V>)) {
        let Some(limit) = self.timeout else {
            return;
        };

        let mut overdue: Vec<(usize, Instant, Worker)> = self
            .running
            .iter()
            .filter(|(_, (start, _))| now.duration_since(*start) >= limit)
            .map(|(&slot, &(start, worker))| (slot, start, worker))
            .collect();
        overdue.sort_unstable_by_key(|&(slot, _, _)| slot);

        for (slot, start, worker) in overdue {
            self.running.remove(&slot);
            self.abandoned.insert(slot);
            tracing::warn!(slot, %worker, ?limit, "task timed out");

            self.record(
                Finished {
                    slot,
                    outcome: Err(TaskFailure::timed_out(limit)),
                    worker,
                    start,
                    duration: now.duration_since(start),
                },
                on_finished,
            );
        }

        if !self.starving() {
            self.starved_at = None;
            return;
        }

        match self.starved_at {
            None => {
                tracing::debug!(
                    pending = self.remaining,
                    "every worker is held by a timed out task"
                );
                self.starved_at = Some(now + limit);
            }
            Some(at) if now >= at => {
                tracing::warn!(
                    pending = self.remaining,
                    "no worker freed up, failing the queued tasks"
                );
                self.fail_unreported(TaskFailure::starved, on_finished);
            }
            Some(_) => {}
        }
    }

    /// Every thread is held by an abandoned unit while work is still queued.
    fn starving(&self) -> bool {
        self.abandoned.len() >= self.threads && self.remaining > 0 && self.running.is_empty()
    }

    fn fail_unreported(
        &mut self,
        failure: impl Fn() -> TaskFailure,
        on_finished: &mut impl FnMut(&Finished<V>),
    ) {
        let now = Instant::now();
        let missing: Vec<usize> = (0..self.results.len())
            .filter(|&slot| self.results[slot].is_none())
            .collect();

        for slot in missing {
            self.record(
                Finished {
                    slot,
                    outcome: Err(failure()),
                    worker: Worker::Unassigned,
                    start: now,
                    duration: Duration::ZERO,
                },
                on_finished,
            );
        }
    }

    fn record(&mut self, finished: Finished<V>, on_finished: &mut impl FnMut(&Finished<V>)) {
        on_finished(&finished);
        let slot = finished.slot;
        self.results[slot] = Some(finished);
        self.remaining -= 1;
    }

    fn into_results(self) -> Vec<Finished<V>> {
        self.results.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    use crate::task::Task;

    fn units(count: usize) -> Vec<Unit<u64>> {
        (0..count)
            .map(|slot| Unit {
                slot,
                task: Arc::new(Task::fetch(format!("T{slot}"))),
                input: Ok(Arc::new(slot as u64)),
            })
            .collect()
    }

    struct Sleepy {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Operator<u64> for Sleepy {
        fn apply(&self, _: &Task, input: Input<'_, u64>) -> anyhow::Result<u64> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(30));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(*input.map_err(|failure| anyhow::anyhow!(failure.clone()))? * 10)
        }
    }

    fn sleepy() -> Arc<Sleepy> {
        Arc::new(Sleepy {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_results_ordered_by_slot() {
        let operator = sleepy();
        let results = run_pooled(0, units(5), &operator, 5, None, |_| {}).unwrap();

        let values: Vec<u64> = results
            .iter()
            .map(|finished| **finished.outcome.as_ref().unwrap())
            .collect();
        assert_eq!(values, [0, 10, 20, 30, 40]);
        assert!(results.iter().all(|f| matches!(f.worker, Worker::Pool(_))));
    }

    #[test]
    fn test_pool_bounds_concurrency() {
        let operator = sleepy();
        run_pooled(0, units(6), &operator, 2, None, |_| {}).unwrap();
        assert!(operator.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_units_run_concurrently() {
        let operator = sleepy();
        run_pooled(0, units(4), &operator, 4, None, |_| {}).unwrap();
        assert!(operator.peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_panic_is_contained() {
        fn explode(task: &Task, _: Input<'_, u64>) -> anyhow::Result<u64> {
            if task.id.as_str() == "T1" {
                panic!("boom");
            }
            Ok(1)
        }

        let operator = Arc::new(explode);
        let results = run_pooled(0, units(3), &operator, 3, None, |_| {}).unwrap();

        assert!(results[0].outcome.is_ok());
        assert_eq!(
            results[1].outcome.as_ref().unwrap_err().message(),
            "Task panicked: boom"
        );
        assert!(results[2].outcome.is_ok());
    }

    #[test]
    fn test_timeout_fails_stalled_unit() {
        fn stall(task: &Task, _: Input<'_, u64>) -> anyhow::Result<u64> {
            if task.id.as_str() == "T0" {
                sleep(Duration::from_millis(500));
            }
            Ok(7)
        }

        let operator = Arc::new(stall);
        let started = Instant::now();
        let mut seen = 0;
        let results = run_pooled(
            0,
            units(3),
            &operator,
            3,
            Some(Duration::from_millis(50)),
            |_| seen += 1,
        )
        .unwrap();

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(seen, 3);
        assert!(
            results[0]
                .outcome
                .as_ref()
                .unwrap_err()
                .message()
                .starts_with("Task timed out after")
        );
        assert!(results[1].outcome.is_ok());
        assert!(results[2].outcome.is_ok());
    }

    #[test]
    fn test_queued_units_wait_for_a_freed_thread() {
        fn uneven(task: &Task, _: Input<'_, u64>) -> anyhow::Result<u64> {
            match task.id.as_str() {
                "T0" => sleep(Duration::from_millis(120)),
                "T1" => sleep(Duration::from_millis(1000)),
                _ => {}
            }
            Ok(7)
        }

        let operator = Arc::new(uneven);
        let results =
            run_pooled(0, units(4), &operator, 2, Some(Duration::from_millis(100)), |_| {})
                .unwrap();

        for finished in &results[..2] {
            assert!(
                finished
                    .outcome
                    .as_ref()
                    .unwrap_err()
                    .message()
                    .starts_with("Task timed out after")
            );
            assert!(matches!(finished.worker, Worker::Pool(_)));
        }
        assert_eq!(**results[2].outcome.as_ref().unwrap(), 7);
        assert_eq!(**results[3].outcome.as_ref().unwrap(), 7);
    }

    #[test]
    fn test_timeout_fails_starved_units() {
        fn stall(_: &Task, _: Input<'_, u64>) -> anyhow::Result<u64> {
            sleep(Duration::from_millis(400));
            Ok(7)
        }

        let operator = Arc::new(stall);
        let started = Instant::now();
        let results =
            run_pooled(0, units(3), &operator, 1, Some(Duration::from_millis(40)), |_| {}).unwrap();

        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|finished| finished.outcome.is_err()));
        assert_eq!(results[0].worker, Worker::Pool(0));
        assert_eq!(
            results[2].outcome.as_ref().unwrap_err().message(),
            TaskFailure::starved().message()
        );
        assert_eq!(results[2].worker, Worker::Unassigned);
    }
}
