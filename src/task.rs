//! Task descriptors, the atomic units of work handed to the scheduler.
//!
//! A [`Task`] names an [`Operation`] and the ids of the tasks whose output it
//! consumes. The list is produced upstream (usually by a query decomposer)
//! and is never modified by the scheduler. The serde representation matches
//! the JSON the decomposer emits:
//!
//! ```json
//! { "task_id": "T3", "operation": "aggregate", "agg_type": "sum",
//!   "agg_field": "sales", "depends_on": ["T2"] }
//! ```

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of a task, unique within one task list.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Comparison used by a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "=", alias = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl Display for Comparator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
        })
    }
}

/// A single `(field, comparator, value)` filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(rename = "operator")]
    pub comparator: Comparator,
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        comparator: Comparator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.field, self.comparator, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    #[serde(alias = "mean")]
    Avg,
    Count,
    Max,
    Min,
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Count => "count",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
        })
    }
}

/// What a task does. Each variant carries only the parameters it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Operation {
    Filter {
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    Group {
        #[serde(rename = "group_by")]
        by: Vec<String>,
    },
    Aggregate {
        #[serde(rename = "agg_type", default)]
        kind: Aggregation,
        #[serde(rename = "agg_field")]
        field: String,
    },
    Fetch,
    /// Operations the scheduler knows nothing about. The payload is handed to
    /// the operator untouched.
    Other {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl Operation {
    /// Short lowercase name of the operation kind.
    pub fn kind(&self) -> &str {
        match self {
            Operation::Filter { .. } => "filter",
            Operation::Group { .. } => "group",
            Operation::Aggregate { .. } => "aggregate",
            Operation::Fetch => "fetch",
            Operation::Other { name, .. } => name,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Filter { conditions } => {
                let conditions: Vec<_> = conditions.iter().map(ToString::to_string).collect();
                write!(f, "filter {}", conditions.join(" and "))
            }
            Operation::Group { by } => write!(f, "group by {}", by.join(", ")),
            Operation::Aggregate { kind, field } => write!(f, "{kind}({field})"),
            Operation::Fetch => f.write_str("fetch"),
            Operation::Other { name, .. } => f.write_str(name),
        }
    }
}

/// A unit of work together with its declared dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "task_id")]
    pub id: TaskId,
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            operation,
            depends_on: Vec::new(),
        }
    }

    pub fn filter(id: impl Into<TaskId>, conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::new(
            id,
            Operation::Filter {
                conditions: conditions.into_iter().collect(),
            },
        )
    }

    pub fn group<S: Into<String>>(id: impl Into<TaskId>, by: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            id,
            Operation::Group {
                by: by.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn aggregate(id: impl Into<TaskId>, kind: Aggregation, field: impl Into<String>) -> Self {
        Self::new(
            id,
            Operation::Aggregate {
                kind,
                field: field.into(),
            },
        )
    }

    pub fn fetch(id: impl Into<TaskId>) -> Self {
        Self::new(id, Operation::Fetch)
    }

    /// Adds a single dependency.
    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Adds several dependencies, keeping their order.
    pub fn depends_on_all<I>(mut self, ids: impl IntoIterator<Item = I>) -> Self
    where
        I: Into<TaskId>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Parses a task list from the JSON array produced by the decomposer.
    pub fn list_from_json(json: &str) -> serde_json::Result<Vec<Task>> {
        serde_json::from_str(json)
    }
}
