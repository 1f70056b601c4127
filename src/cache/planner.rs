//! Propagation planning.
//!
//! Expands one or more touched roots into a breadth-first list of resources,
//! each appearing exactly once, so a pass does bounded work even when the
//! graph contains cycles.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::domain::ResourceId;

use super::graph::DependencyGraph;

/// One resource to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTouch {
    pub resource: ResourceId,
    /// 0 for roots.
    pub depth: usize,
    /// The resource whose change reached this one; `None` for roots.
    pub via: Option<ResourceId>,
}

/// Ordered set of touches for a single propagation pass.
#[derive(Debug, Default)]
pub struct PropagationPlan {
    pub steps: Vec<PlannedTouch>,
    /// True if an already planned resource was reached again through an edge
    /// that lies on a cycle.
    pub cycle_detected: bool,
}

impl fmt::Display for PropagationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PropagationPlan {{ touches: {}, max_depth: {}, cycle: {} }}",
            self.steps.len(),
            self.max_depth(),
            self.cycle_detected
        )
    }
}

impl PropagationPlan {
    /// Breadth-first expansion from `roots`.
    ///
    /// Duplicate roots are merged; a resource reachable from several roots is
    /// touched once, at its shallowest depth.
    pub fn build(graph: &DependencyGraph, roots: &[ResourceId]) -> Self {
        let mut plan = Self::default();
        let mut visited: HashSet<ResourceId> = HashSet::new();
        let mut queue: VecDeque<PlannedTouch> = VecDeque::new();

        for root in roots {
            if visited.insert(root.clone()) {
                queue.push_back(PlannedTouch {
                    resource: root.clone(),
                    depth: 0,
                    via: None,
                });
            }
        }

        while let Some(step) = queue.pop_front() {
            for dependent in graph.dependents_of(&step.resource) {
                if visited.contains(&dependent) {
                    // The edge step -> dependent closes a cycle when dependent
                    // leads back to step, whichever branch planned it first.
                    if !plan.cycle_detected && graph.reaches(&dependent, &step.resource) {
                        plan.cycle_detected = true;
                    }
                    continue;
                }
                visited.insert(dependent.clone());
                queue.push_back(PlannedTouch {
                    resource: dependent,
                    depth: step.depth + 1,
                    via: Some(step.resource.clone()),
                });
            }
            plan.steps.push(step);
        }

        plan
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.steps.iter().map(|s| s.depth).max().unwrap_or(0)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceId> {
        self.steps.iter().map(|s| &s.resource)
    }
}
