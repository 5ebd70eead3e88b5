//! Level resolver: validates a task list and builds the immutable `TaskGraph`.
//!
//! Validation collects every problem before failing so an operator sees the
//! whole picture in one pass:
//! - ids must be unique and non-empty, levels start at 1
//! - every dependency must reference an existing task
//! - no cycles (Kahn's algorithm)
//! - a task sits strictly above every task it depends on
//! - within a level, `create ∪ modify` sets are pairwise disjoint

use crate::errors::{GraphProblem, ValidationError};
use crate::graph::task::{Task, normalize_path};
use std::collections::{BTreeMap, HashMap};

/// Index into the task list.
pub type TaskIndex = usize;

/// A validated, immutable task graph partitioned into levels.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
    /// level -> task indices, ascending by level
    levels: BTreeMap<u32, Vec<TaskIndex>>,
    /// (level, path) -> owning task id
    ownership: HashMap<(u32, String), String>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index_map.get(id).and_then(|&i| self.tasks.get(i))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    /// Levels in processing order.
    pub fn levels(&self) -> Vec<u32> {
        self.levels.keys().copied().collect()
    }

    pub fn first_level(&self) -> Option<u32> {
        self.levels.keys().next().copied()
    }

    /// The level processed after `level`, if any.
    pub fn next_level(&self, level: u32) -> Option<u32> {
        self.levels
            .range(level.saturating_add(1)..)
            .next()
            .map(|(l, _)| *l)
    }

    /// The level processed before `level`, if any.
    pub fn previous_level(&self, level: u32) -> Option<u32> {
        self.levels.range(..level).next_back().map(|(l, _)| *l)
    }

    pub fn tasks_at(&self, level: u32) -> Vec<&Task> {
        self.levels
            .get(&level)
            .map(|indices| indices.iter().filter_map(|&i| self.tasks.get(i)).collect())
            .unwrap_or_default()
    }

    /// Task ids the given task depends on.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index_map
            .get(id)
            .map(|&i| {
                self.reverse_edges[i]
                    .iter()
                    .map(|&d| self.tasks[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Task ids that depend on the given task.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.index_map
            .get(id)
            .map(|&i| {
                self.forward_edges[i]
                    .iter()
                    .map(|&d| self.tasks[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The task that exclusively owns `path` at `level`.
    pub fn owner_of(&self, path: &str, level: u32) -> Option<&str> {
        self.ownership
            .get(&(level, normalize_path(path)))
            .map(String::as_str)
    }
}

/// Builder for validated task graphs.
pub struct LevelResolver {
    tasks: Vec<Task>,
}

impl LevelResolver {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Validate and build. No side effects.
    pub fn resolve(self) -> Result<TaskGraph, ValidationError> {
        let mut problems = Vec::new();

        let mut index_map = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.id.trim().is_empty() {
                problems.push(GraphProblem::EmptyId);
                continue;
            }
            if index_map.insert(task.id.clone(), i).is_some() {
                problems.push(GraphProblem::DuplicateId(task.id.clone()));
            }
            if task.level == 0 {
                problems.push(GraphProblem::ZeroLevel {
                    task: task.id.clone(),
                });
            }
            if task.verification.timeout_seconds == 0 {
                problems.push(GraphProblem::ZeroTimeout {
                    task: task.id.clone(),
                });
            }
            let create: Vec<String> = task.files.create.iter().map(|p| normalize_path(p)).collect();
            for path in task.files.modify.iter().map(|p| normalize_path(p)) {
                if create.contains(&path) {
                    problems.push(GraphProblem::CreateModifyOverlap {
                        task: task.id.clone(),
                        path,
                    });
                }
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];

        for (to_idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                match index_map.get(dep) {
                    Some(&from_idx) => {
                        forward_edges[from_idx].push(to_idx);
                        reverse_edges[to_idx].push(from_idx);
                    }
                    None => problems.push(GraphProblem::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }),
                }
            }
        }

        if let Some(cycle) = find_cycle(&self.tasks, &forward_edges, &reverse_edges) {
            problems.push(cycle);
        } else {
            for (idx, task) in self.tasks.iter().enumerate() {
                for &dep_idx in &reverse_edges[idx] {
                    let dep = &self.tasks[dep_idx];
                    if dep.level >= task.level {
                        problems.push(GraphProblem::LevelOrder {
                            task: task.id.clone(),
                            level: task.level,
                            dependency: dep.id.clone(),
                            dependency_level: dep.level,
                        });
                    }
                }
            }
        }

        let mut levels: BTreeMap<u32, Vec<TaskIndex>> = BTreeMap::new();
        let mut ownership: HashMap<(u32, String), String> = HashMap::new();
        for (idx, task) in self.tasks.iter().enumerate() {
            levels.entry(task.level).or_default().push(idx);
            for path in task.files.owned() {
                let key = (task.level, path.clone());
                match ownership.get(&key) {
                    Some(first) if first != &task.id => {
                        problems.push(GraphProblem::OwnershipOverlap {
                            level: task.level,
                            path,
                            first: first.clone(),
                            second: task.id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        ownership.insert(key, task.id.clone());
                    }
                }
            }
        }

        if !problems.is_empty() {
            return Err(ValidationError::Invalid(problems));
        }

        Ok(TaskGraph {
            tasks: self.tasks,
            index_map,
            forward_edges,
            reverse_edges,
            levels,
            ownership,
        })
    }
}

/// Kahn's algorithm; returns the tasks left with unresolved in-degree.
fn find_cycle(
    tasks: &[Task],
    forward_edges: &[Vec<TaskIndex>],
    reverse_edges: &[Vec<TaskIndex>],
) -> Option<GraphProblem> {
    let mut in_degree: Vec<usize> = reverse_edges.iter().map(|deps| deps.len()).collect();
    let mut queue: Vec<TaskIndex> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in &forward_edges[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed == tasks.len() {
        return None;
    }

    let mut involved: Vec<String> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg > 0)
        .map(|(i, _)| tasks[i].id.clone())
        .collect();
    involved.sort();
    Some(GraphProblem::Cycle { tasks: involved })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, level: u32, deps: &[&str]) -> Task {
        Task::new(
            id,
            &format!("Task {}", id),
            level,
            deps.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn problems(err: ValidationError) -> Vec<GraphProblem> {
        match err {
            ValidationError::Invalid(p) => p,
            other => panic!("expected Invalid, got {other}"),
        }
    }

    #[test]
    fn test_build_levels() {
        let graph = LevelResolver::new(vec![
            task("T1", 1, &[]),
            task("T2", 1, &[]),
            task("T3", 2, &["T1", "T2"]),
            task("T4", 3, &["T3"]),
        ])
        .resolve()
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.levels(), vec![1, 2, 3]);
        assert_eq!(graph.tasks_at(1).len(), 2);
        assert_eq!(graph.next_level(1), Some(2));
        assert_eq!(graph.next_level(3), None);
        assert_eq!(graph.previous_level(2), Some(1));
        assert_eq!(graph.previous_level(1), None);
        assert_eq!(graph.dependencies_of("T3"), vec!["T1", "T2"]);
        assert_eq!(graph.dependents_of("T3"), vec!["T4"]);
    }

    #[test]
    fn test_sparse_levels_processed_in_order() {
        let graph = LevelResolver::new(vec![task("A", 2, &[]), task("B", 5, &["A"])])
            .resolve()
            .unwrap();
        assert_eq!(graph.first_level(), Some(2));
        assert_eq!(graph.next_level(2), Some(5));
    }

    #[test]
    fn test_cycle_detection() {
        let err = LevelResolver::new(vec![
            task("T1", 1, &["T3"]),
            task("T2", 2, &["T1"]),
            task("T3", 3, &["T2"]),
        ])
        .resolve()
        .unwrap_err();
        let problems = problems(err);
        assert!(problems.iter().any(|p| matches!(
            p,
            GraphProblem::Cycle { tasks } if tasks == &vec!["T1".to_string(), "T2".into(), "T3".into()]
        )));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = LevelResolver::new(vec![task("T1", 2, &["ghost"])])
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert_eq!(err.offending_tasks(), vec!["T1"]);
    }

    #[test]
    fn test_same_level_dependency_rejected() {
        let err = LevelResolver::new(vec![task("T1", 1, &[]), task("T2", 1, &["T1"])])
            .resolve()
            .unwrap_err();
        assert!(problems(err).iter().any(|p| matches!(
            p,
            GraphProblem::LevelOrder { task, dependency, .. } if task == "T2" && dependency == "T1"
        )));
    }

    #[test]
    fn test_ownership_overlap_rejected() {
        let err = LevelResolver::new(vec![
            task("T1", 1, &[]).with_files(&["src/a.rs"], &[]),
            task("T2", 1, &[]).with_files(&[], &["./src/a.rs"]),
        ])
        .resolve()
        .unwrap_err();
        assert!(problems(err).iter().any(|p| matches!(
            p,
            GraphProblem::OwnershipOverlap { level: 1, path, .. } if path == "src/a.rs"
        )));
    }

    #[test]
    fn test_same_path_on_different_levels_allowed() {
        let graph = LevelResolver::new(vec![
            task("T1", 1, &[]).with_files(&["src/a.rs"], &[]),
            task("T2", 2, &["T1"]).with_files(&[], &["src/a.rs"]),
        ])
        .resolve()
        .unwrap();
        assert_eq!(graph.owner_of("src/a.rs", 1), Some("T1"));
        assert_eq!(graph.owner_of("./src/a.rs", 2), Some("T2"));
        assert_eq!(graph.owner_of("src/a.rs", 3), None);
    }

    #[test]
    fn test_read_sets_may_overlap() {
        let mut a = task("T1", 1, &[]).with_files(&["a.rs"], &[]);
        a.files.read = vec!["shared.rs".into()];
        let mut b = task("T2", 1, &[]).with_files(&["b.rs"], &[]);
        b.files.read = vec!["shared.rs".into()];
        assert!(LevelResolver::new(vec![a, b]).resolve().is_ok());
    }

    #[test]
    fn test_duplicate_and_zero_level_collected_together() {
        let err = LevelResolver::new(vec![task("T1", 0, &[]), task("T1", 1, &[])])
            .resolve()
            .unwrap_err();
        let problems = problems(err);
        assert!(problems.contains(&GraphProblem::DuplicateId("T1".into())));
        assert!(problems.contains(&GraphProblem::ZeroLevel { task: "T1".into() }));
    }

    #[test]
    fn test_create_modify_overlap_within_task() {
        let err = LevelResolver::new(vec![task("T1", 1, &[]).with_files(&["x.rs"], &["x.rs"])])
            .resolve()
            .unwrap_err();
        assert!(problems(err)
            .iter()
            .any(|p| matches!(p, GraphProblem::CreateModifyOverlap { .. })));
    }

    #[test]
    fn test_empty_graph() {
        let graph = LevelResolver::new(vec![]).resolve().unwrap();
        assert!(graph.is_empty());
        assert!(graph.levels().is_empty());
        assert_eq!(graph.first_level(), None);
    }
}
