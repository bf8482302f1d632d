//! The dependency graph built from a flat task list.
//!
//! Every task becomes a node, and for every declared dependency `d` of a task
//! `t` an edge `d -> t` is added, so edges point from producers to consumers.
//! Node indices follow the input order of the task list, which is what keeps
//! level planning stable.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::PlanError;
use crate::task::{Task, TaskId};

/// Forward adjacency and in-degree counts for a validated task list.
#[derive(Debug, Clone)]
pub struct Dag {
    pub(crate) graph: DiGraph<Task, ()>,
    pub(crate) lookup: HashMap<TaskId, NodeIndex>,
    pub(crate) in_degree: Vec<usize>,
}

impl Dag {
    /// Builds the graph, rejecting duplicate ids and dangling references.
    ///
    /// Cycles are not detected here; they surface when the graph is planned.
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self, PlanError> {
        let tasks = tasks.into_iter();
        let mut graph = DiGraph::with_capacity(tasks.size_hint().0, 0);
        let mut lookup = HashMap::new();

        for task in tasks {
            match lookup.entry(task.id.clone()) {
                Entry::Occupied(_) => return Err(PlanError::DuplicateTask(task.id)),
                Entry::Vacant(slot) => {
                    slot.insert(graph.add_node(task));
                }
            }
        }

        let mut in_degree = vec![0; graph.node_count()];
        let mut edges = Vec::new();

        for index in graph.node_indices() {
            let task = &graph[index];
            for dependency in &task.depends_on {
                let Some(&source) = lookup.get(dependency) else {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dependency.clone(),
                    });
                };

                edges.push((source, index));
                in_degree[index.index()] += 1;
            }
        }

        for (source, target) in edges {
            graph.add_edge(source, target, ());
        }

        tracing::debug!(
            tasks = graph.node_count(),
            edges = graph.edge_count(),
            "built dependency graph"
        );

        Ok(Self {
            graph,
            lookup,
            in_degree,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.lookup.get(id).map(|&index| &self.graph[index])
    }

    /// Number of declared dependencies of a task.
    pub fn in_degree(&self, id: &TaskId) -> Option<usize> {
        self.lookup.get(id).map(|index| self.in_degree[index.index()])
    }

    /// Ids of the tasks that consume the output of `id`, in input order.
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        let Some(&index) = self.lookup.get(id) else {
            return Vec::new();
        };

        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        dependents.sort_unstable();
        dependents.dedup();

        dependents
            .into_iter()
            .map(|index| &self.graph[index].id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_counts_in_degree() {
        let dag = Dag::build([
            Task::fetch("T1"),
            Task::fetch("T2"),
            Task::fetch("T3").depends_on_all(["T1", "T2"]),
        ])
        .unwrap();

        assert_eq!(dag.len(), 3);
        assert_eq!(dag.in_degree(&"T1".into()), Some(0));
        assert_eq!(dag.in_degree(&"T3".into()), Some(2));
        assert_eq!(dag.dependents(&"T1".into()), vec![&TaskId::from("T3")]);
        assert!(dag.dependents(&"T3".into()).is_empty());
    }

    #[test]
    fn test_unknown_dependency() {
        let err = Dag::build([Task::fetch("T1"), Task::fetch("T2").depends_on("missing")])
            .unwrap_err();

        assert_eq!(
            err,
            PlanError::UnknownDependency {
                task: "T2".into(),
                dependency: "missing".into(),
            }
        );
    }

    #[test]
    fn test_duplicate_task() {
        let err = Dag::build([Task::fetch("T1"), Task::fetch("T1")]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateTask("T1".into()));
    }

    #[test]
    fn test_dependents_in_input_order() {
        let dag = Dag::build([
            Task::fetch("root"),
            Task::fetch("a").depends_on("root"),
            Task::fetch("b").depends_on("root"),
            Task::fetch("c").depends_on("root"),
        ])
        .unwrap();

        let dependents: Vec<_> = dag
            .dependents(&"root".into())
            .into_iter()
            .map(TaskId::as_str)
            .collect();
        assert_eq!(dependents, ["a", "b", "c"]);
    }
}
