//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Edges point from a dependency to its dependent: `from` must complete
//! before `to` may start.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Why one task must wait for another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// Declared in the task record.
    #[default]
    Declared,
    /// Synthesized because both tasks target overlapping files.
    FileConflict {
        /// The target patterns that overlap.
        patterns: Vec<String>,
    },
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Declared => write!(f, "declared"),
            DependencyType::FileConflict { patterns } => {
                write!(f, "file conflict: {}", patterns.join(", "))
            }
        }
    }
}

/// A topological generation: tasks with no dependencies between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingLevel {
    pub index: usize,
    pub tasks: Vec<TaskId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<Task, DependencyType>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the DAG.
    ///
    /// If a task with the same id already exists, returns the existing index.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency: `from` must complete before `to` can start.
    ///
    /// # Errors
    /// Returns an error if either task is unknown or the edge would close a cycle.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let (from_index, to_index) = self.indices(from, to)?;

        if from_index == to_index || has_path_connecting(&self.graph, to_index, from_index, None) {
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                from, to
            )));
        }

        self.graph.update_edge(from_index, to_index, dep_type);
        Ok(())
    }

    /// Add an edge without checking for cycles.
    ///
    /// Used while loading a batch whose acyclicity is verified afterwards
    /// with [`TaskDAG::find_cycle`].
    pub fn add_dependency_unchecked(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let (from_index, to_index) = self.indices(from, to)?;
        self.graph.update_edge(from_index, to_index, dep_type);
        Ok(())
    }

    fn indices(&self, from: &TaskId, to: &TaskId) -> Result<(NodeIndex, NodeIndex)> {
        let from_index = self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskNotFound(from.clone()))?;
        let to_index = self
            .task_index
            .get(to)
            .ok_or_else(|| Error::TaskNotFound(to.clone()))?;
        Ok((*from_index, *to_index))
    }

    /// Whether `to` is reachable from `from` (including `from == to`).
    pub fn has_path(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn status(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.get_task(id).map(|t| &t.status)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyType> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge)
    }

    /// Direct dependencies of a task.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a task.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable from `id` along dependency edges, in BFS order.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    if let Some(task) = self.graph.node_weight(next) {
                        out.push(task.id.clone());
                    }
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Edges as `(from, to, type)` triples.
    pub fn edges(&self) -> Vec<(TaskId, TaskId, DependencyType)> {
        self.graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.graph.edge_endpoints(e)?;
                Some((
                    self.graph.node_weight(a)?.id.clone(),
                    self.graph.node_weight(b)?.id.clone(),
                    self.graph.edge_weight(e)?.clone(),
                ))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    // ========== Scheduling Operations ==========

    /// Queued tasks whose dependencies have all completed.
    pub fn ready_candidates(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if task.status != TaskStatus::Queued {
                    return None;
                }
                let deps_done = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| d.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                deps_done.then(|| task.id.clone())
            })
            .collect()
    }

    /// Whether every dependency of `id` has completed.
    pub fn dependencies_completed(&self, id: &TaskId) -> bool {
        self.get_dependencies(id)
            .iter()
            .all(|d| d.status == TaskStatus::Completed)
    }

    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(|t| t.status.is_terminal())
    }

    pub fn count_where(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.graph.node_weights().filter(|t| pred(&t.status)).count()
    }

    /// Find a dependency cycle with a three-color depth-first search.
    ///
    /// Returns the cycle as a path that starts and ends on the same task.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color = vec![Color::White; self.graph.node_count()];
        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by_key(|n| self.graph[*n].seq);

        for start in starts {
            if color[start.index()] != Color::White {
                continue;
            }
            color[start.index()] = Color::Gray;
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> =
                vec![(start, self.successors(start), 0)];

            loop {
                let Some(top) = stack.last_mut() else { break };
                let node = top.0;
                if top.2 >= top.1.len() {
                    color[node.index()] = Color::Black;
                    stack.pop();
                    continue;
                }
                let next = top.1[top.2];
                top.2 += 1;

                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        stack.push((next, self.successors(next), 0));
                    }
                    Color::Gray => {
                        let pos = stack.iter().position(|(n, _, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<TaskId> = stack[pos..]
                            .iter()
                            .map(|(n, _, _)| self.graph[*n].id.clone())
                            .collect();
                        path.push(self.graph[next].id.clone());
                        return Some(path);
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        next.sort_by_key(|n| self.graph[*n].seq);
        next
    }

    /// Group tasks into topological generations.
    ///
    /// A task's level is one more than the deepest of its dependencies.
    /// Within a level tasks are ordered by the scheduling tie-break.
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle.
    pub fn levels(&self) -> Result<Vec<SchedulingLevel>> {
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut current: Vec<NodeIndex> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut levels = Vec::new();
        let mut visited = 0;

        while !current.is_empty() {
            visited += current.len();
            let mut next = Vec::new();
            for node in &current {
                for succ in self.graph.neighbors_directed(*node, Direction::Outgoing) {
                    if let Some(d) = indegree.get_mut(&succ) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(succ);
                        }
                    }
                }
            }
            let mut tasks: Vec<&Task> = current.iter().map(|n| &self.graph[*n]).collect();
            tasks.sort_by(|a, b| schedule_order(a, b));
            levels.push(SchedulingLevel {
                index: levels.len(),
                tasks: tasks.into_iter().map(|t| t.id.clone()).collect(),
            });
            current = next;
        }

        if visited != self.graph.node_count() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(Error::Spec(crate::error::SpecError::Cycle { path }));
        }
        Ok(levels)
    }
}

/// Ready-queue ordering: priority descending, complexity ascending, then input order.
pub fn schedule_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.complexity.cmp(&b.complexity))
        .then(a.seq.cmp(&b.seq))
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
