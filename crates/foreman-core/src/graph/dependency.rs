//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (predecessors)
//! - Reverse edges: task -> tasks that depend on it (successors)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - BTreeSet adjacency so every walk is deterministic for a fixed graph

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::domain::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

/// Dependency graph for tracking task dependencies.
///
/// Edges are only ever added. Completion is a task status, not an edge removal.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, BTreeSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A".
    /// Does not check for cycles; callers validate on a trial copy first.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges.entry(depends_on).or_default().insert(task);
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    /// Direct predecessors, sorted.
    pub fn dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct successors, sorted.
    pub fn dependents(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Transitive successors of `task` (excluding `task`), sorted.
    ///
    /// Breadth-first over the reverse edges, O(V + E).
    pub fn all_dependents(&self, task: TaskId) -> Vec<TaskId> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        queue.push_back(task);

        while let Some(current) = queue.pop_front() {
            if let Some(next) = self.reverse_edges.get(&current) {
                for &succ in next {
                    if succ != task && seen.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }

        let mut out: Vec<TaskId> = seen.into_iter().collect();
        out.sort();
        out
    }

    /// Detect a cycle in the dependency graph.
    ///
    /// Returns the first cycle found as a path in "depends on" direction that
    /// starts and ends with the same task, or None if the graph is a DAG.
    /// Iterative three-color DFS, O(V + E).
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut starts: Vec<TaskId> = self.edges.keys().copied().collect();
        starts.sort();

        let mut color: HashMap<TaskId, Color> = HashMap::new();
        for start in starts {
            if color.get(&start).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(start, &mut color) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(&self, start: TaskId, color: &mut HashMap<TaskId, Color>) -> Option<Vec<TaskId>> {
        struct Frame {
            node: TaskId,
            deps: Vec<TaskId>,
            next: usize,
        }

        let mut path: Vec<TaskId> = vec![start];
        let mut stack = vec![Frame {
            node: start,
            deps: self.dependencies(start),
            next: 0,
        }];
        color.insert(start, Color::Gray);

        loop {
            let (node, next) = {
                let frame = stack.last_mut()?;
                let next = frame.deps.get(frame.next).copied();
                frame.next += 1;
                (frame.node, next)
            };

            let Some(dep) = next else {
                color.insert(node, Color::Black);
                stack.pop();
                path.pop();
                continue;
            };

            match color.get(&dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let from = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::White => {
                    color.insert(dep, Color::Gray);
                    path.push(dep);
                    stack.push(Frame {
                        node: dep,
                        deps: self.dependencies(dep),
                        next: 0,
                    });
                }
                Color::Black => {}
            }
        }
    }

    /// Kahn's algorithm over `nodes`: predecessors first, ties broken by id.
    ///
    /// Returns None if the nodes do not form a DAG.
    pub fn topological_order(&self, nodes: impl IntoIterator<Item = TaskId>) -> Option<Vec<TaskId>> {
        let nodes: BTreeSet<TaskId> = nodes.into_iter().collect();
        let mut in_degree: HashMap<TaskId, usize> = nodes
            .iter()
            .map(|&n| {
                let deg = self
                    .edges
                    .get(&n)
                    .map(|deps| deps.iter().filter(|d| nodes.contains(d)).count())
                    .unwrap_or(0);
                (n, deg)
            })
            .collect();

        let mut frontier: BTreeSet<TaskId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(node) = frontier.pop_first() {
            order.push(node);
            for succ in self.dependents(node) {
                if let Some(deg) = in_degree.get_mut(&succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        frontier.insert(succ);
                    }
                }
            }
        }

        (order.len() == nodes.len()).then_some(order)
    }
}
