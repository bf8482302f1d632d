//! Level planning.
//!
//! The plan is a level-grained topological sort of the [`Dag`]. All tasks of
//! a level are mutually independent and may run together; every dependency of
//! a task in level `k` lives in a level `< k`. Levels are executed one after
//! another with a barrier in between.

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::error::PlanError;
use crate::graph::Dag;
use crate::task::{Task, TaskId};

/// One barrier-delimited group of independent tasks.
#[derive(Debug, Clone)]
pub struct Level {
    pub(crate) index: usize,
    pub(crate) tasks: Vec<Arc<Task>>,
}

impl Level {
    /// Zero-based position of this level in the plan.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().map(|task| &task.id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// The read-only schedule produced from a task list.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    levels: Vec<Level>,
    lookup: HashMap<TaskId, (usize, Arc<Task>)>,
}

impl ExecutionPlan {
    /// Builds the dependency graph and plans it in one step.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Result<Self, PlanError> {
        Self::new(Dag::build(tasks)?)
    }

    /// Partitions the graph into levels with Kahn's algorithm.
    ///
    /// Each round takes the whole ready queue as one level. Tasks unlocked by
    /// that level are only ever queued for the next one. Within a level the
    /// input order is kept, so planning the same list twice gives the same
    /// result.
    pub fn new(dag: Dag) -> Result<Self, PlanError> {
        let mut in_degree = dag.in_degree.clone();
        let mut ready: Vec<NodeIndex> = dag
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] == 0)
            .collect();

        let mut layers: Vec<Vec<NodeIndex>> = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let current = std::mem::take(&mut ready);

            for &index in &current {
                for edge in dag.graph.edges_directed(index, Direction::Outgoing) {
                    let degree = &mut in_degree[edge.target().index()];
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(edge.target());
                    }
                }
            }

            ready.sort_unstable();
            placed += current.len();
            layers.push(current);
        }

        if placed < dag.len() {
            return Err(PlanError::CycleDetected(cycle_members(&dag, &in_degree)));
        }

        let (nodes, _) = dag.graph.into_nodes_edges();
        let mut tasks: Vec<Option<Arc<Task>>> =
            nodes.into_iter().map(|node| Some(Arc::new(node.weight))).collect();

        let mut lookup = HashMap::with_capacity(tasks.len());
        let levels = layers
            .into_iter()
            .enumerate()
            .map(|(level, members)| Level {
                index: level,
                tasks: members
                    .into_iter()
                    .filter_map(|index| tasks[index.index()].take())
                    .inspect(|task| {
                        lookup.insert(task.id.clone(), (level, task.clone()));
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            tasks = lookup.len(),
            levels = levels.len(),
            "planned execution levels"
        );

        Ok(Self { levels, lookup })
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Total number of tasks across all levels.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Arc<Task>> {
        self.lookup.get(id).map(|(_, task)| task)
    }

    pub fn level_of(&self, id: &TaskId) -> Option<usize> {
        self.lookup.get(id).map(|(level, _)| *level)
    }

    /// Size of the widest level.
    pub fn max_parallelism(&self) -> usize {
        self.levels.iter().map(Level::len).max().unwrap_or(0)
    }

    /// Tasks per level, the speedup an ideal pool could reach on equal tasks.
    pub fn theoretical_speedup(&self) -> f64 {
        if self.levels.is_empty() {
            return 1.0;
        }

        self.len() as f64 / self.levels.len() as f64
    }

    /// The last level, whose results form the final output of a run.
    pub fn final_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Renders the plan as a Mermaid diagram with one subgraph per level.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        // Mermaid ids must be plain identifiers, task ids need not be.
        let mut nodes: HashMap<&TaskId, usize> = HashMap::new();

        for level in &self.levels {
            writeln!(f, "    subgraph L{}[\"Level {}\"]", level.index, level.index + 1).unwrap();
            for task in &level.tasks {
                let node = nodes.len();
                nodes.insert(&task.id, node);

                let name = task.id.as_str().replace('"', "#quot;");
                let label = task.operation.to_string().replace('"', "#quot;");
                writeln!(f, "        n{node}[\"{name}: {label}\"]").unwrap();
            }
            writeln!(f, "    end").unwrap();
        }

        for level in &self.levels {
            for task in &level.tasks {
                for dependency in &task.depends_on {
                    if let (Some(source), Some(target)) = (nodes.get(dependency), nodes.get(&task.id)) {
                        writeln!(f, "    n{source} --> n{target}").unwrap();
                    }
                }
            }
        }

        f
    }
}

/// Tasks that sit on a cycle: members of strongly connected components with
/// more than one node, plus tasks depending on themselves. Falls back to
/// every unplaced task if the graph somehow yields none.
fn cycle_members(dag: &Dag, in_degree: &[usize]) -> Vec<TaskId> {
    let mut members: Vec<NodeIndex> = tarjan_scc(&dag.graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || dag.graph.contains_edge(component[0], component[0])
        })
        .flatten()
        .collect();

    if members.is_empty() {
        members = dag
            .graph
            .node_indices()
            .filter(|index| in_degree[index.index()] > 0)
            .collect();
    }

    members.sort_unstable();
    members
        .into_iter()
        .map(|index| dag.graph[index].id.clone())
        .collect()
}

impl Display for ExecutionPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Execution plan: {} tasks in {} levels (max parallelism {})",
            self.len(),
            self.levels.len(),
            self.max_parallelism()
        )?;

        for level in &self.levels {
            writeln!(
                f,
                "Level {} (parallel: {}, tasks: {})",
                level.index + 1,
                level.len() > 1,
                level.len()
            )?;

            for task in &level.tasks {
                write!(f, "  [{}] {}", task.id, task.operation)?;
                if !task.depends_on.is_empty() {
                    let deps: Vec<_> = task.depends_on.iter().map(TaskId::as_str).collect();
                    write!(f, "  (waits for: {})", deps.join(", "))?;
                }
                writeln!(f)?;
            }
        }

        Ok(())
    }
}
