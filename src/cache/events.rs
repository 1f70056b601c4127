//! Invalidation events.
//!
//! Every resource touched by a propagation pass produces one event. Sinks
//! receive them in plan order, and a bounded journal keeps the most recent
//! ones for the admin surface.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ResourceId;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

/// Monotonic sequence number for ordering events within this process.
pub type Epoch = u64;

/// What happened to the resource an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Version advanced; cached output derived from it is stale.
    Touched,
    /// Resource removed; the root of a delete pass.
    Deleted,
}

/// One resource touched during a propagation pass.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationEvent {
    /// Unique identifier, usable for idempotent sink handling.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub resource: ResourceId,
    /// Resource whose change started the pass.
    pub root: ResourceId,
    pub depth: usize,
    /// Touch generation the resource advanced to.
    pub generation: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(
        kind: EventKind,
        epoch: Epoch,
        resource: ResourceId,
        root: ResourceId,
        depth: usize,
        generation: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            resource,
            root,
            depth,
            generation,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }
}

/// Bounded, in-memory record of recent invalidation events.
///
/// The oldest events are dropped once `capacity` is reached.
pub struct EventJournal {
    events: Mutex<VecDeque<InvalidationEvent>>,
    capacity: usize,
    epoch_counter: AtomicU64,
}

impl EventJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn record(&self, event: InvalidationEvent) {
        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            resource = %event.resource,
            "Invalidation event recorded"
        );

        if self.capacity == 0 {
            return;
        }
        let mut events = mutex_lock(&self.events, SOURCE, "record");
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Newest first, at most `limit` events.
    pub fn recent(&self, limit: usize) -> Vec<InvalidationEvent> {
        mutex_lock(&self.events, SOURCE, "recent")
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.events, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.events, SOURCE, "clear").clear();
    }
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(journal: &EventJournal, resource: &str) -> InvalidationEvent {
        let id: ResourceId = resource.parse().expect("valid id");
        InvalidationEvent::new(
            EventKind::Touched,
            journal.next_epoch(),
            id.clone(),
            id,
            0,
            1,
        )
    }

    #[test]
    fn epochs_are_monotonic() {
        let journal = EventJournal::new(4);
        let e1 = journal.next_epoch();
        let e2 = journal.next_epoch();
        assert!(e2 > e1);
    }

    #[test]
    fn event_ids_are_unique() {
        let journal = EventJournal::new(4);
        let a = event(&journal, "company#1");
        let b = event(&journal, "company#1");
        assert_ne!(a.id, b.id);
        assert!(a.is_root());
    }

    #[test]
    fn journal_drops_oldest_past_capacity() {
        let journal = EventJournal::new(2);
        for name in ["node#a", "node#b", "node#c"] {
            let e = event(&journal, name);
            journal.record(e);
        }

        assert_eq!(journal.len(), 2);
        let recent = journal.recent(10);
        assert_eq!(recent[0].resource.to_string(), "node#c");
        assert_eq!(recent[1].resource.to_string(), "node#b");
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let journal = EventJournal::new(0);
        let e = event(&journal, "node#a");
        journal.record(e);
        assert!(journal.is_empty());
    }

    #[test]
    fn recent_respects_limit_and_clear_empties() {
        let journal = EventJournal::new(8);
        for name in ["node#a", "node#b", "node#c"] {
            let e = event(&journal, name);
            journal.record(e);
        }
        assert_eq!(journal.recent(1).len(), 1);
        journal.clear();
        assert!(journal.is_empty());
    }

    #[test]
    fn events_serialize_with_snake_case_kind() {
        let journal = EventJournal::new(1);
        let e = event(&journal, "company#1");
        let json = serde_json::to_value(&e).expect("serialize");
        assert_eq!(json["kind"], "touched");
        assert_eq!(json["resource"], "company#1");
    }
}
