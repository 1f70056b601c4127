//! Touch generations for cacheable resources.
//!
//! A resource's own `version_token` only moves when the persistence layer
//! mutates it. Propagated touches (a child changed, so the parent's cached
//! output is stale) are recorded here instead, as a per-resource generation
//! drawn from one process-wide monotonic clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use time::OffsetDateTime;

use crate::domain::ResourceId;

/// Current touch state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionState {
    /// Zero until the resource is touched for the first time.
    pub generation: u64,
    pub touched_at: Option<OffsetDateTime>,
}

impl VersionState {
    const UNTOUCHED: Self = Self {
        generation: 0,
        touched_at: None,
    };
}

/// Sharded map of touch generations.
///
/// Bumps on different resources never contend on a shared lock; bumps on the
/// same resource serialize on its shard, and the stored generation only ever
/// moves forward.
///
/// Entries are never removed. A deleted resource keeps the generation its
/// deletion drew, so one re-created under the same identity and version
/// token cannot derive a key it had before.
pub struct VersionRegistry {
    clock: AtomicU64,
    states: DashMap<ResourceId, VersionState>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(1),
            states: DashMap::new(),
        }
    }

    /// Current state; untouched resources report generation 0.
    pub fn current(&self, id: &ResourceId) -> VersionState {
        self.states
            .get(id)
            .map(|state| *state)
            .unwrap_or(VersionState::UNTOUCHED)
    }

    /// Advance the resource to a fresh generation and return the new state.
    pub fn touch(&self, id: &ResourceId) -> VersionState {
        let generation = self.clock.fetch_add(1, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();

        let mut entry = self
            .states
            .entry(id.clone())
            .or_insert(VersionState::UNTOUCHED);
        // A concurrent toucher may have stored a later generation between our
        // fetch_add and acquiring the shard; never move backwards.
        if generation > entry.generation {
            entry.generation = generation;
        }
        entry.touched_at = Some(match entry.touched_at {
            Some(previous) if previous > now => previous,
            _ => now,
        });
        *entry
    }

    /// True if any resource in `observed` has moved past the generation
    /// recorded for it.
    pub fn any_advanced(&self, observed: &HashMap<ResourceId, u64>) -> bool {
        observed
            .iter()
            .any(|(id, generation)| self.current(id).generation > *generation)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for VersionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
