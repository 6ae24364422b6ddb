//! Task dependency graph.
//!
//! A [`TaskGraph`] holds named tasks and the tasks each one depends on. It
//! detects cycles (depth-first search with a recursion stack) and produces
//! execution orders with Kahn's algorithm, optionally breaking ties among
//! ready tasks by priority rank.

pub mod feature_list;
pub mod priority;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use feature_list::{Feature, FeatureList};
pub use priority::{compare_priority, priority_rank};

/// Execution status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    Pending,
    /// Submitted to the pool.
    Running,
    /// Finished successfully.
    Done,
    /// Failed, or never ran because a dependency failed.
    Failed,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One schedulable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskNode {
    pub id: String,
    pub name: String,
    /// Ids this task waits for, in declaration order, without duplicates.
    pub dependencies: Vec<String>,
    /// Raw priority label, see [`priority_rank`].
    pub priority: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

impl TaskNode {
    pub fn rank(&self) -> u8 {
        priority_rank(&self.priority)
    }
}

/// Graph validation errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Task id must not be empty")]
    EmptyId,

    #[error("Duplicate task id '{id}'")]
    DuplicateTask { id: String },

    #[error("Task '{id}' depends on itself")]
    SelfDependency { id: String },

    #[error("Task '{id}' depends on unknown task '{dependency}'")]
    UnknownDependency { id: String, dependency: String },

    #[error("Dependency graph contains a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Invalid feature list {location}: {message}")]
    FeatureList { location: String, message: String },
}

/// Dependency graph over tasks keyed by id.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: BTreeMap<String, TaskNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with the lowest priority.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        dependencies: &[&str],
    ) -> Result<(), GraphError> {
        let deps = dependencies.iter().map(|d| (*d).to_string()).collect();
        self.insert(id.into(), name.into(), deps, String::new(), TaskStatus::Pending)
    }

    /// Register a task with an explicit priority label.
    pub fn add_node_with_priority(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        dependencies: &[&str],
        priority: impl Into<String>,
    ) -> Result<(), GraphError> {
        let deps = dependencies.iter().map(|d| (*d).to_string()).collect();
        self.insert(id.into(), name.into(), deps, priority.into(), TaskStatus::Pending)
    }

    fn insert(
        &mut self,
        id: String,
        name: String,
        dependencies: Vec<String>,
        priority: String,
        status: TaskStatus,
    ) -> Result<(), GraphError> {
        if id.trim().is_empty() {
            return Err(GraphError::EmptyId);
        }
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateTask { id });
        }
        let mut seen = HashSet::new();
        let mut deps = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if dep == id {
                return Err(GraphError::SelfDependency { id });
            }
            if seen.insert(dep.clone()) {
                deps.push(dep);
            }
        }

        debug!(task_id = %id, dependencies = deps.len(), "Adding task");
        self.nodes.insert(
            id.clone(),
            TaskNode {
                id,
                name,
                dependencies: deps,
                priority,
                status,
                error: None,
            },
        );
        Ok(())
    }

    /// Load every feature of a feature-list file as a task.
    ///
    /// Features that already pass (or are marked done/implemented) load as
    /// [`TaskStatus::Done`]. Returns the parsed list for its metadata.
    pub fn load_from_feature_list(&mut self, path: &Path) -> Result<FeatureList, GraphError> {
        let list = FeatureList::from_path(path)?;
        self.load_features(&list)?;
        info!(
            path = %path.display(),
            project = %list.project_name,
            features = list.features.len(),
            "Loaded feature list"
        );
        Ok(list)
    }

    /// Add the features of an already parsed list.
    pub fn load_features(&mut self, list: &FeatureList) -> Result<(), GraphError> {
        for feature in &list.features {
            let name = if feature.description.is_empty() {
                feature.id.clone()
            } else {
                feature.description.clone()
            };
            let status = if feature.is_complete() {
                TaskStatus::Done
            } else {
                TaskStatus::Pending
            };
            self.insert(
                feature.id.clone(),
                name,
                feature.dependencies.depends_on_ids.clone(),
                feature.priority.clone(),
                status,
            )?;
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// All tasks in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn set_status(&mut self, id: &str, status: TaskStatus, error: Option<String>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = status;
            node.error = error;
        }
    }

    /// Check that every dependency exists and that the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|d| !self.nodes.contains_key(*d))
            {
                return Err(GraphError::UnknownDependency {
                    id: node.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        match self.detect_cycles() {
            Some(path) => Err(GraphError::Cycle { path }),
            None => Ok(()),
        }
    }

    /// Return the first cycle found, as a path whose first and last ids are
    /// equal (`[a, b, a]`), or `None` if the graph is acyclic.
    ///
    /// Tasks are visited in id order and dependencies in declaration order,
    /// so the result is deterministic. Unknown dependencies are ignored.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        for id in self.nodes.keys() {
            if !marks.contains_key(id.as_str()) {
                if let Some(cycle) = self.visit(id, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::InProgress);
        stack.push(id);

        if let Some(node) = self.nodes.get(id) {
            for dep in &node.dependencies {
                if !self.nodes.contains_key(dep) {
                    continue;
                }
                match marks.get(dep.as_str()) {
                    Some(Mark::InProgress) => {
                        let start = stack.iter().position(|s| *s == dep)?;
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| (*s).to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        if let Some(cycle) = self.visit(dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    /// In-degrees and reverse edges over known tasks only.
    fn kahn_inputs(&self) -> (HashMap<&str, usize>, HashMap<&str, Vec<&str>>) {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in self.nodes.values() {
            let known = node
                .dependencies
                .iter()
                .filter(|d| self.nodes.contains_key(*d));
            let mut count = 0;
            for dep in known {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
                count += 1;
            }
            in_degree.insert(node.id.as_str(), count);
        }
        (in_degree, dependents)
    }

    fn cycle_error(&self) -> GraphError {
        GraphError::Cycle {
            path: self.detect_cycles().unwrap_or_default(),
        }
    }

    /// Any order in which every task follows all of its dependencies.
    pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
        let (mut in_degree, dependents) = self.kahn_inputs();
        let mut queue: VecDeque<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for &next in dependents.get(id).map_or(&[][..], Vec::as_slice) {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(self.cycle_error())
        }
    }

    /// Kahn's algorithm that always emits the highest-ranked ready task,
    /// ties broken by ascending id.
    pub fn topological_sort_with_priority(&self) -> Result<Vec<String>, GraphError> {
        let (mut in_degree, dependents) = self.kahn_inputs();
        let mut ready: BinaryHeap<(u8, Reverse<&str>)> = self
            .nodes
            .values()
            .filter(|n| in_degree.get(n.id.as_str()).copied() == Some(0))
            .map(|n| (n.rank(), Reverse(n.id.as_str())))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, Reverse(id))) = ready.pop() {
            order.push(id.to_string());
            for &next in dependents.get(id).map_or(&[][..], Vec::as_slice) {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        let rank = self.nodes.get(next).map_or(1, TaskNode::rank);
                        ready.push((rank, Reverse(next)));
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(self.cycle_error())
        }
    }

    /// Pending tasks whose dependencies are all done.
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        self.nodes
            .values()
            .filter(|n| n.status == TaskStatus::Pending)
            .filter(|n| {
                n.dependencies.iter().all(|d| {
                    self.nodes
                        .get(d)
                        .is_some_and(|dep| dep.status == TaskStatus::Done)
                })
            })
            .collect()
    }

    /// Count tasks in each status.
    pub fn task_summary(&self) -> HashMap<TaskStatus, usize> {
        let mut counts: HashMap<TaskStatus, usize> = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> TaskGraph {
        let mut g = TaskGraph::new();
        for (id, deps) in edges {
            g.add_node(*id, format!("task {id}"), deps).unwrap();
        }
        g
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|s| s == id).unwrap()
    }

    fn assert_respects_edges(g: &TaskGraph, order: &[String]) {
        assert_eq!(order.len(), g.len());
        for node in g.nodes() {
            for dep in &node.dependencies {
                assert!(
                    position(order, dep) < position(order, &node.id),
                    "{dep} must precede {} in {order:?}",
                    node.id
                );
            }
        }
    }

    // =========================================================================
    // Construction
    // =========================================================================

    #[test]
    fn rejects_duplicate_id() {
        let mut g = graph(&[("a", &[])]);
        let err = g.add_node("a", "again", &[]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTask { ref id } if id == "a"));
        assert_eq!(g.node("a").unwrap().name, "task a");
    }

    #[test]
    fn rejects_self_dependency() {
        let mut g = TaskGraph::new();
        let err = g.add_node("a", "a", &["a"]).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
        assert!(g.is_empty());
    }

    #[test]
    fn rejects_empty_id() {
        let mut g = TaskGraph::new();
        assert!(matches!(
            g.add_node("  ", "blank", &[]),
            Err(GraphError::EmptyId)
        ));
    }

    #[test]
    fn collapses_duplicate_dependencies() {
        let g = graph(&[("a", &[]), ("b", &["a", "a"])]);
        assert_eq!(g.node("b").unwrap().dependencies, vec!["a"]);
    }

    // =========================================================================
    // Validation and cycles
    // =========================================================================

    #[test]
    fn validate_reports_unknown_dependency() {
        let g = graph(&[("a", &["ghost"])]);
        let err = g.validate().unwrap_err();
        match err {
            GraphError::UnknownDependency { dependency, .. } => assert_eq!(dependency, "ghost"),
            other => panic!("Expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn detects_three_node_cycle() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let cycle = g.detect_cycles().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle, vec!["a", "c", "b", "a"]);
        assert!(matches!(g.validate(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn cycle_behind_acyclic_prefix_is_found() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["d"]), ("d", &["c"])]);
        let cycle = g.detect_cycles().unwrap();
        assert_eq!(cycle, vec!["c", "d", "c"]);
    }

    #[test]
    fn diamond_has_no_cycle() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert!(g.detect_cycles().is_none());
        assert!(g.validate().is_ok());
    }

    #[test]
    fn empty_graph_is_valid() {
        let g = TaskGraph::new();
        assert!(g.detect_cycles().is_none());
        assert!(g.topological_sort().unwrap().is_empty());
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    #[test]
    fn topological_sort_respects_edges() {
        let g = graph(&[
            ("deploy", &["build", "test"]),
            ("build", &["fetch"]),
            ("test", &["build"]),
            ("fetch", &[]),
            ("docs", &[]),
        ]);
        let order = g.topological_sort().unwrap();
        assert_respects_edges(&g, &order);
    }

    #[test]
    fn topological_sort_fails_on_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let err = g.topological_sort().unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn topological_sort_ignores_unknown_dependencies() {
        let g = graph(&[("a", &["ghost"]), ("b", &["a"])]);
        assert_eq!(g.topological_sort().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn priority_sort_prefers_higher_rank_then_id() {
        let mut g = TaskGraph::new();
        g.add_node_with_priority("A", "a", &["B"], "Low").unwrap();
        g.add_node_with_priority("B", "b", &[], "High").unwrap();
        g.add_node_with_priority("C", "c", &["B"], "Medium").unwrap();
        g.add_node_with_priority("D", "d", &[], "High").unwrap();

        let order = g.topological_sort_with_priority().unwrap();
        assert_eq!(order, vec!["B", "D", "C", "A"]);
        assert_respects_edges(&g, &order);
    }

    #[test]
    fn priority_sort_mixes_vocabularies() {
        let mut g = TaskGraph::new();
        g.add_node_with_priority("poc", "p", &[], "POC").unwrap();
        g.add_node_with_priority("prod", "p", &[], "production").unwrap();
        g.add_node_with_priority("mvp", "m", &[], "MVP").unwrap();
        assert_eq!(
            g.topological_sort_with_priority().unwrap(),
            vec!["prod", "mvp", "poc"]
        );
    }

    // =========================================================================
    // Status reporting
    // =========================================================================

    #[test]
    fn ready_tasks_follow_done_dependencies() {
        let mut g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let ready: Vec<&str> = g.ready_tasks().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        g.set_status("a", TaskStatus::Done, None);
        let ready: Vec<&str> = g.ready_tasks().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn summary_counts_each_status() {
        let mut g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        g.set_status("a", TaskStatus::Done, None);
        g.set_status("b", TaskStatus::Failed, Some("boom".to_string()));
        let summary = g.task_summary();
        assert_eq!(summary.get(&TaskStatus::Done), Some(&1));
        assert_eq!(summary.get(&TaskStatus::Failed), Some(&1));
        assert_eq!(summary.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(summary.get(&TaskStatus::Running), None);
    }

    #[test]
    fn loads_feature_list_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.json");
        std::fs::write(
            &path,
            r#"{"projectName": "shop", "features": [
                {"id": "F1", "description": "Login", "priority": "High", "passes": true},
                {"id": "F2", "description": "Cart", "priority": "MVP",
                 "dependencies": {"dependsOnIDs": ["F1"]}},
                {"id": "F3", "status": "done"}
            ]}"#,
        )
        .unwrap();

        let mut g = TaskGraph::new();
        let list = g.load_from_feature_list(&path).unwrap();
        assert_eq!(list.project_name, "shop");
        assert_eq!(g.len(), 3);
        assert_eq!(g.node("F1").unwrap().status, TaskStatus::Done);
        assert_eq!(g.node("F2").unwrap().name, "Cart");
        assert_eq!(g.node("F2").unwrap().dependencies, vec!["F1"]);
        assert_eq!(g.node("F2").unwrap().status, TaskStatus::Pending);
        assert_eq!(g.node("F3").unwrap().name, "F3");
    }

    #[test]
    fn feature_list_with_duplicate_ids_is_rejected() {
        let list = FeatureList::from_json(
            "inline",
            r#"{"features": [{"id": "x"}, {"id": "x"}]}"#,
        )
        .unwrap();
        let mut g = TaskGraph::new();
        assert!(matches!(
            g.load_features(&list),
            Err(GraphError::DuplicateTask { .. })
        ));
    }

    #[test]
    fn unreadable_feature_list_is_validation_error() {
        let mut g = TaskGraph::new();
        let err = g
            .load_from_feature_list(Path::new("/nonexistent/features.json"))
            .unwrap_err();
        assert!(matches!(err, GraphError::FeatureList { .. }));
    }
}
