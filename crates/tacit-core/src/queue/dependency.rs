//! Dependency graph between queued operations.
//!
//! Design:
//! - Forward edges: operation -> operations it depends on (whose results it uses)
//! - Reverse edges: operation -> operations that depend on it (waiting operations)
//! - Invariant: edges and reverse_edges must be kept in sync
//! - Invariant: the graph is acyclic; `try_add_dependency` refuses closing edges

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::ids::OperationId;

/// Dependency graph for tracking operation dependencies.
///
/// This graph maintains both forward and reverse edges for efficient lookups:
/// - `edges`: OperationId -> Set of OperationIds it depends on
/// - `reverse_edges`: OperationId -> Set of OperationIds waiting for it
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: operation -> operations it depends on (waits for)
    edges: HashMap<OperationId, HashSet<OperationId>>,

    /// Reverse edges: operation -> operations that depend on it
    /// Enables O(1) lookup: "who is waiting for this operation?"
    reverse_edges: HashMap<OperationId, HashSet<OperationId>>,
}

impl DependencyGraph {
    /// Create an empty dependency graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// `operation` depends on `depends_on` (B waits for A is `insert_edge(b, a)`).
    fn insert_edge(&mut self, operation: OperationId, depends_on: OperationId) {
        self.edges.entry(operation).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(operation);
    }

    /// Add a dependency unless it would close a cycle.
    ///
    /// On refusal returns the cycle the edge would have created, starting and
    /// ending at `operation` (`[op, op]` for a self-dependency).
    pub fn try_add_dependency(
        &mut self,
        operation: OperationId,
        depends_on: OperationId,
    ) -> Result<(), Vec<OperationId>> {
        if operation == depends_on {
            return Err(vec![operation, operation]);
        }
        // the new edge closes a cycle iff `operation` is already reachable from `depends_on`
        if let Some(mut path) = self.path(depends_on, operation) {
            path.insert(0, operation);
            return Err(path);
        }
        self.insert_edge(operation, depends_on);
        Ok(())
    }

    /// Remove a dependency: `operation` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, operation: OperationId, depends_on: OperationId) {
        if let Entry::Occupied(mut e) = self.edges.entry(operation) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&operation);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Drop every edge touching `operation` (it left the queue).
    pub fn remove_operation(&mut self, operation: OperationId) {
        for depends_on in self.get_dependencies(operation) {
            self.remove_dependency(operation, depends_on);
        }
        for waiting in self.get_waiting(operation) {
            self.remove_dependency(waiting, operation);
        }
    }

    /// Operations waiting for `operation`.
    pub fn get_waiting(&self, operation: OperationId) -> Vec<OperationId> {
        self.reverse_edges
            .get(&operation)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Get all dependencies of an operation.
    pub fn get_dependencies(&self, operation: OperationId) -> Vec<OperationId> {
        self.edges
            .get(&operation)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// A dependency path `from -> ... -> to`, if one exists.
    fn path(&self, from: OperationId, to: OperationId) -> Option<Vec<OperationId>> {
        let mut prev: HashMap<OperationId, OperationId> = HashMap::new();
        let mut visited = HashSet::from([from]);
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                let mut path = vec![to];
                let mut current = to;
                while let Some(&p) = prev.get(&current) {
                    path.push(p);
                    current = p;
                }
                path.reverse();
                return Some(path);
            }
            for dep in self.get_dependencies(node) {
                if visited.insert(dep) {
                    prev.insert(dep, node);
                    stack.push(dep);
                }
            }
        }
        None
    }
}
