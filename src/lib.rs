#![forbid(unsafe_code)]
//! Dependency-aware task scheduling with a level-barrier parallel executor.
//!
//! A list of [`Task`]s with declared dependencies is turned into a [`Dag`],
//! partitioned into levels by an [`ExecutionPlan`], and run level by level by
//! an [`Executor`]. Tasks of one level share nothing and run concurrently on
//! a pool sized for that level; the next level starts only once every task
//! of the current one has a result.
//!
//! ```no_run
//! use strata::frame::{Frame, TableOperator, Value};
//! use strata::{Aggregation, Comparator, Condition, Executor, Task};
//!
//! # fn main() -> anyhow::Result<()> {
//! let tasks = vec![
//!     Task::filter("T1", [Condition::new("year", Comparator::Eq, 2023)]),
//!     Task::group("T2", ["region"]).depends_on("T1"),
//!     Task::aggregate("T3", Aggregation::Sum, "sales").depends_on("T2"),
//! ];
//!
//! let data: Value = Frame::default().into();
//! let report = Executor::new(TableOperator).pool_size(4).run(tasks, data)?;
//! println!("{}", report.metrics());
//! # Ok(())
//! # }
//! ```

mod config;
mod core;
mod error;
mod executor;
pub mod frame;
mod graph;
mod merge;
mod operator;
mod plan;
mod task;
mod utils;

pub use crate::config::ExecutorConfig;
pub use crate::core::Hash32;
pub use crate::error::{ConfigError, ExecuteError, PlanError, TaskFailure};
pub use crate::executor::diagnostics::Diagnostics;
pub use crate::executor::{
    ExecutionReport, Executor, LevelTiming, Metrics, Primary, ResultStore, TaskResult, Worker,
};
pub use crate::graph::Dag;
pub use crate::merge::{MergeRule, Mergeable, Outcome, Shape, merge, merge_with_rule};
pub use crate::operator::{Input, Operator};
pub use crate::plan::{ExecutionPlan, Level};
pub use crate::task::{Aggregation, Comparator, Condition, Operation, Task, TaskId};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
