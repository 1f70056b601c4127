//! Resource dependency graph.
//!
//! Edges read "when `dependency` changes, `dependent` must be invalidated".
//! Edges are explicit data: static ones are declared when resource types are
//! wired up, dynamic ones are linked at mutation time.

use std::collections::{HashMap, HashSet, VecDeque};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::domain::ResourceId;

/// How an edge entered the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Static,
    Dynamic,
}

/// Process-wide, append-mostly dependency graph.
///
/// Both directions are stored in sharded maps so lookups during propagation
/// never take a graph-wide lock.
pub struct DependencyGraph {
    /// dependency -> dependents
    dependents: DashMap<ResourceId, HashMap<ResourceId, EdgeKind>>,
    /// dependent -> dependencies (back-references only, never ownership)
    dependencies: DashMap<ResourceId, HashSet<ResourceId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            dependents: DashMap::new(),
            dependencies: DashMap::new(),
        }
    }

    /// Register a static edge. Returns false if the edge already existed or
    /// was a self-edge.
    pub fn declare_dependency(&self, dependent: &ResourceId, dependency: &ResourceId) -> bool {
        self.insert(dependent, dependency, EdgeKind::Static)
    }

    /// Register a dynamic edge, e.g. a child pointing at the parent it was
    /// just attached to.
    pub fn link(&self, dependent: &ResourceId, dependency: &ResourceId) -> bool {
        self.insert(dependent, dependency, EdgeKind::Dynamic)
    }

    /// Remove an edge. Returns true if it existed.
    pub fn unlink(&self, dependent: &ResourceId, dependency: &ResourceId) -> bool {
        let removed = match self.dependents.get_mut(dependency) {
            Some(mut edges) => edges.remove(dependent).is_some(),
            None => false,
        };
        self.dependents
            .remove_if(dependency, |_, edges| edges.is_empty());

        if let Some(mut back) = self.dependencies.get_mut(dependent) {
            back.remove(dependency);
        }
        self.dependencies
            .remove_if(dependent, |_, back| back.is_empty());

        removed
    }

    /// Drop every edge touching `resource`.
    pub fn forget(&self, resource: &ResourceId) {
        for dependent in self.dependents_of(resource) {
            self.unlink(&dependent, resource);
        }
        for dependency in self.dependencies_of(resource) {
            self.unlink(resource, &dependency);
        }
    }

    /// Direct dependents, sorted for deterministic propagation order.
    pub fn dependents_of(&self, resource: &ResourceId) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = self
            .dependents
            .get(resource)
            .map(|edges| edges.keys().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Direct dependencies (the inverse `dependency_of` edge).
    pub fn dependencies_of(&self, resource: &ResourceId) -> Vec<ResourceId> {
        let mut out: Vec<ResourceId> = self
            .dependencies
            .get(resource)
            .map(|back| back.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn edge_kind(&self, dependent: &ResourceId, dependency: &ResourceId) -> Option<EdgeKind> {
        self.dependents
            .get(dependency)
            .and_then(|edges| edges.get(dependent).copied())
    }

    /// True if a touch of `from` reaches `to`.
    pub fn reaches(&self, from: &ResourceId, to: &ResourceId) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == to {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            queue.extend(self.dependents_of(&current));
        }
        false
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.iter().map(|edges| edges.len()).sum()
    }

    fn insert(&self, dependent: &ResourceId, dependency: &ResourceId, kind: EdgeKind) -> bool {
        if dependent == dependency {
            warn!(
                resource = %dependent,
                edge_kind = ?kind,
                result = "ignored",
                "Ignoring self dependency"
            );
            return false;
        }

        if self.reaches(dependent, dependency) {
            // Propagation still terminates; the visited set stops the loop.
            warn!(
                dependent = %dependent,
                dependency = %dependency,
                edge_kind = ?kind,
                "Dependency edge closes a cycle"
            );
        }

        let inserted = self
            .dependents
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone(), kind)
            .is_none();
        self.dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());

        if inserted {
            debug!(
                dependent = %dependent,
                dependency = %dependency,
                edge_kind = ?kind,
                "Dependency edge registered"
            );
        }
        inserted
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
