//! Dependency-aware batching of development tasks.
//!
//! The breakdown's task DAG is flattened ahead of execution into waves
//! ("batches") that are safe to run concurrently: a task joins a batch
//! only once everything it depends on sits in an earlier batch. Batches
//! execute strictly sequentially.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;

use crate::store::records::{DevelopmentTask, TaskBreakdown};

/// The batched execution order for one breakdown.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// Batches in execution order, each sorted by priority ascending.
    pub batches: Vec<Vec<DevelopmentTask>>,
    /// True when a cycle or unresolved dependency forced the remainder
    /// into one final batch instead of deadlocking.
    pub fallback_batch: bool,
}

impl ExecutionPlan {
    /// Compute concurrency-safe batches for a breakdown.
    ///
    /// Pre-computed parallel groups are consumed first; remaining tasks
    /// are batched by repeatedly collecting everything whose dependencies
    /// are already batched. A scan that makes no progress while tasks
    /// remain (cycle or dependency on an unknown id) dumps the remainder
    /// into one final batch and logs a warning: liveness is preferred
    /// over strict ordering in this edge case.
    pub fn analyze(breakdown: &TaskBreakdown) -> Self {
        let by_id: HashMap<&str, &DevelopmentTask> = breakdown
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t))
            .collect();

        let mut batches: Vec<Vec<DevelopmentTask>> = Vec::new();
        let mut batched: HashSet<String> = HashSet::new();

        // Pre-computed groups are trusted: their members are treated as
        // satisfied for everything scheduled after them.
        for group in &breakdown.parallel_groups {
            let mut batch: Vec<DevelopmentTask> = Vec::new();
            for id in group {
                if batched.contains(id) {
                    continue;
                }
                match by_id.get(id.as_str()) {
                    Some(task) => {
                        batched.insert(id.clone());
                        batch.push((*task).clone());
                    }
                    None => {
                        tracing::warn!(task_id = %id, "parallel group references unknown task");
                    }
                }
            }
            if !batch.is_empty() {
                batch.sort_by_key(|t| t.priority);
                batches.push(batch);
            }
        }

        loop {
            let mut ready: Vec<DevelopmentTask> = breakdown
                .tasks
                .iter()
                .filter(|t| !batched.contains(&t.id))
                .filter(|t| t.dependencies.iter().all(|d| batched.contains(d)))
                .cloned()
                .collect();

            if ready.is_empty() {
                let mut remainder: Vec<DevelopmentTask> = breakdown
                    .tasks
                    .iter()
                    .filter(|t| !batched.contains(&t.id))
                    .cloned()
                    .collect();
                if remainder.is_empty() {
                    break;
                }

                let cause = if has_cycle(&remainder) {
                    "dependency cycle"
                } else {
                    "unresolved dependencies"
                };
                tracing::warn!(
                    tasks = remainder.len(),
                    cause,
                    "batching stalled, running remainder in one final batch"
                );
                remainder.sort_by_key(|t| t.priority);
                for task in &remainder {
                    batched.insert(task.id.clone());
                }
                batches.push(remainder);
                return Self {
                    batches,
                    fallback_batch: true,
                };
            }

            ready.sort_by_key(|t| t.priority);
            for task in &ready {
                batched.insert(task.id.clone());
            }
            batches.push(ready);
        }

        Self {
            batches,
            fallback_batch: false,
        }
    }

    /// Total number of tasks across all batches.
    pub fn task_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

fn has_cycle(tasks: &[DevelopmentTask]) -> bool {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for task in tasks {
        nodes.insert(task.id.as_str(), graph.add_node(task.id.as_str()));
    }
    for task in tasks {
        for dep in &task.dependencies {
            if let (Some(&from), Some(&to)) = (nodes.get(dep.as_str()), nodes.get(task.id.as_str()))
            {
                graph.add_edge(from, to, ());
            }
        }
    }
    is_cyclic_directed(&graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: i32, deps: &[&str]) -> DevelopmentTask {
        DevelopmentTask {
            id: id.to_string(),
            title: format!("Task {}", id),
            task_type: "feature".to_string(),
            files: vec![format!("src/{}.ts", id)],
            priority,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            acceptance_criteria: Vec::new(),
        }
    }

    fn breakdown(tasks: Vec<DevelopmentTask>) -> TaskBreakdown {
        TaskBreakdown {
            tasks,
            parallel_groups: Vec::new(),
        }
    }

    fn all_ids(plan: &ExecutionPlan) -> Vec<String> {
        plan.batches
            .iter()
            .flatten()
            .map(|t| t.id.clone())
            .collect()
    }

    #[test]
    fn test_independent_then_joined() {
        // A and B independent, C depends on both: two batches.
        let plan = ExecutionPlan::analyze(&breakdown(vec![
            task("A", 1, &[]),
            task("B", 2, &[]),
            task("C", 1, &["A", "B"]),
        ]));

        assert_eq!(plan.batches.len(), 2);
        let first: Vec<&str> = plan.batches[0].iter().map(|t| t.id.as_str()).collect();
        assert_eq!(first, vec!["A", "B"]);
        assert_eq!(plan.batches[1][0].id, "C");
        assert!(!plan.fallback_batch);
    }

    #[test]
    fn test_union_is_input_set_exactly_once() {
        let plan = ExecutionPlan::analyze(&breakdown(vec![
            task("A", 1, &[]),
            task("B", 1, &["A"]),
            task("C", 1, &["B"]),
            task("D", 1, &["A"]),
        ]));

        let mut ids = all_ids(&plan);
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
        assert_eq!(plan.task_count(), 4);
    }

    #[test]
    fn test_batches_sorted_by_priority() {
        let plan = ExecutionPlan::analyze(&breakdown(vec![
            task("low", 9, &[]),
            task("high", 0, &[]),
            task("mid", 4, &[]),
        ]));

        let order: Vec<&str> = plan.batches[0].iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_cycle_terminates_and_places_every_task() {
        let plan = ExecutionPlan::analyze(&breakdown(vec![
            task("A", 1, &["B"]),
            task("B", 1, &["A"]),
            task("C", 1, &[]),
        ]));

        assert!(plan.fallback_batch);
        let mut ids = all_ids(&plan);
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C"]);
        // C is independent and batches normally; the cycle lands in the
        // final fallback batch.
        assert_eq!(plan.batches[0][0].id, "C");
        assert_eq!(plan.batches.last().expect("batch").len(), 2);
    }

    #[test]
    fn test_unknown_dependency_falls_back() {
        let plan = ExecutionPlan::analyze(&breakdown(vec![task("A", 1, &["ghost"])]));
        assert!(plan.fallback_batch);
        assert_eq!(plan.task_count(), 1);
    }

    #[test]
    fn test_precomputed_groups_consumed_first() {
        let mut b = breakdown(vec![
            task("A", 1, &[]),
            task("B", 1, &[]),
            task("C", 1, &["A", "B"]),
        ]);
        b.parallel_groups = vec![vec!["A".to_string(), "B".to_string()]];

        let plan = ExecutionPlan::analyze(&b);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].len(), 2);
        assert_eq!(plan.batches[1][0].id, "C");
    }

    #[test]
    fn test_empty_breakdown() {
        let plan = ExecutionPlan::analyze(&TaskBreakdown::default());
        assert!(plan.batches.is_empty());
        assert!(!plan.fallback_batch);
    }
}
