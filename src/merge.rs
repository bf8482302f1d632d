//! Fan-in of several upstream results into one task input.
//!
//! Only tasks with more than one dependency go through here. The policy,
//! checked in order:
//!
//! 1. every input is a grouped view: they describe the same grouping, take
//!    the first;
//! 2. every input is a table: keep the rows present in all of them, which
//!    models the logical AND of several upstream filters;
//! 3. every input failed: one failure carrying all messages, in dependency
//!    order;
//! 4. some inputs failed: the first successful input.
//!
//! Any other combination of successful inputs cannot be reconciled and falls
//! back to the first input, with a warning.

use std::sync::Arc;

use crate::error::TaskFailure;

/// Either the value a task produced or the reason it did not.
pub type Outcome<V> = Result<Arc<V>, TaskFailure>;

/// Coarse classification of a value, as far as merging is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Rows with a stable identity that can be intersected.
    Table,
    /// An intermediate grouping that has not been aggregated yet.
    Grouped,
    /// Anything else.
    Opaque,
}

/// Values that can take part in a dependency merge.
pub trait Mergeable: Sized {
    fn shape(&self) -> Shape;

    /// Keeps only the rows present in every input. Called with at least two
    /// inputs, all of [`Shape::Table`]. Returns `None` when the inputs cannot
    /// be intersected, for example because their columns differ.
    fn intersect(inputs: &[&Self]) -> Option<Self>;
}

/// Which branch of the policy produced a merged input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    FirstGrouped,
    Intersection,
    CombinedFailure,
    FirstSuccess,
    /// Successful inputs of incompatible shapes; the first one was used.
    Ambiguous,
}

/// Combines the outcomes of several dependencies into one input.
pub fn merge<V: Mergeable>(outcomes: &[&Outcome<V>]) -> Outcome<V> {
    merge_with_rule(outcomes).0
}

/// Like [`merge`], also reporting the rule that was applied.
pub fn merge_with_rule<V: Mergeable>(outcomes: &[&Outcome<V>]) -> (Outcome<V>, MergeRule) {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();

    for outcome in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(failure) => failures.push(failure),
        }
    }

    let Some(&first) = values.first() else {
        let failure = match failures.as_slice() {
            [] => TaskFailure::new("Task has no inputs to merge"),
            failures => TaskFailure::combine(failures.iter().copied()),
        };
        return (Err(failure), MergeRule::CombinedFailure);
    };

    if !failures.is_empty() {
        return (Ok(first.clone()), MergeRule::FirstSuccess);
    }

    if values.iter().all(|value| value.shape() == Shape::Grouped) {
        return (Ok(first.clone()), MergeRule::FirstGrouped);
    }

    if values.iter().all(|value| value.shape() == Shape::Table) {
        let inputs: Vec<&V> = values.iter().map(|value| Arc::as_ref(value)).collect();
        if let Some(merged) = V::intersect(&inputs) {
            return (Ok(Arc::new(merged)), MergeRule::Intersection);
        }
    }

    tracing::warn!(
        inputs = values.len(),
        "cannot reconcile dependency outputs, using the first one"
    );
    (Ok(first.clone()), MergeRule::Ambiguous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Probe {
        Rows(Vec<u32>),
        Groups(&'static str),
        Blob,
    }

    impl Mergeable for Probe {
        fn shape(&self) -> Shape {
            match self {
                Probe::Rows(_) => Shape::Table,
                Probe::Groups(_) => Shape::Grouped,
                Probe::Blob => Shape::Opaque,
            }
        }

        fn intersect(inputs: &[&Self]) -> Option<Self> {
            let mut rows = match inputs[0] {
                Probe::Rows(rows) => rows.clone(),
                _ => return None,
            };
            for input in &inputs[1..] {
                let Probe::Rows(other) = input else {
                    return None;
                };
                rows.retain(|row| other.contains(row));
            }
            Some(Probe::Rows(rows))
        }
    }

    fn ok(probe: Probe) -> Outcome<Probe> {
        Ok(Arc::new(probe))
    }

    fn err(message: &str) -> Outcome<Probe> {
        Err(TaskFailure::new(message))
    }

    #[test]
    fn test_grouped_takes_first() {
        let a = ok(Probe::Groups("a"));
        let b = ok(Probe::Groups("b"));

        let (merged, rule) = merge_with_rule(&[&a, &b]);
        assert_eq!(*merged.unwrap(), Probe::Groups("a"));
        assert_eq!(rule, MergeRule::FirstGrouped);
    }

    #[test]
    fn test_tables_intersect() {
        let a = ok(Probe::Rows(vec![1, 2, 3, 5, 8]));
        let b = ok(Probe::Rows(vec![8, 3, 4, 5]));
        let c = ok(Probe::Rows(vec![5, 8, 13]));

        let (merged, rule) = merge_with_rule(&[&a, &b, &c]);
        assert_eq!(*merged.unwrap(), Probe::Rows(vec![5, 8]));
        assert_eq!(rule, MergeRule::Intersection);
    }

    #[test]
    fn test_all_failures_combine() {
        let a = err("Error: a");
        let b = err("Error: b");

        let (merged, rule) = merge_with_rule(&[&a, &b]);
        assert_eq!(merged.unwrap_err().message(), "Error: a; Error: b");
        assert_eq!(rule, MergeRule::CombinedFailure);
    }

    #[test]
    fn test_mixed_prefers_first_success() {
        let a = err("Error: a");
        let b = ok(Probe::Rows(vec![1]));
        let c = ok(Probe::Rows(vec![2]));

        let (merged, rule) = merge_with_rule(&[&a, &b, &c]);
        assert_eq!(*merged.unwrap(), Probe::Rows(vec![1]));
        assert_eq!(rule, MergeRule::FirstSuccess);
    }

    #[test]
    fn test_incompatible_shapes_fall_back() {
        let a = ok(Probe::Groups("a"));
        let b = ok(Probe::Rows(vec![1]));
        let c = ok(Probe::Blob);

        let (merged, rule) = merge_with_rule(&[&a, &b, &c]);
        assert_eq!(*merged.unwrap(), Probe::Groups("a"));
        assert_eq!(rule, MergeRule::Ambiguous);
    }

    #[test]
    fn test_merge_is_pure() {
        let a = ok(Probe::Rows(vec![1, 2]));
        let b = ok(Probe::Rows(vec![2, 3]));

        let first = merge(&[&a, &b]).unwrap();
        let second = merge(&[&a, &b]).unwrap();
        assert_eq!(first, second);
        assert_eq!(*a.unwrap(), Probe::Rows(vec![1, 2]));
    }
}
