//! Dependency collector for page artifacts.
//!
//! Uses `tokio::task_local!` to record which resources were read while a
//! response was rendered, together with the touch generation each had when
//! its key was derived. `KeyGenerator` records every identity it derives a
//! key for, so handlers that build their output from cache keys register
//! their dependencies without extra calls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;

use crate::domain::ResourceId;

/// Resource -> generation observed while rendering.
pub type Observed = HashMap<ResourceId, u64>;

tokio::task_local! {
    static DEPS: RefCell<Observed>;
}

/// Record a resource dependency read at `generation`. Ignored when no
/// collector is active.
///
/// A resource recorded twice keeps the older generation: the output may have
/// been built from either read.
pub fn record(resource: &ResourceId, generation: u64) {
    let _ = DEPS.try_with(|deps| {
        deps.borrow_mut()
            .entry(resource.clone())
            .and_modify(|seen| *seen = (*seen).min(generation))
            .or_insert(generation);
    });
}

/// Snapshot of the dependencies recorded so far in the current task.
pub fn collect() -> Observed {
    DEPS.try_with(|deps| deps.borrow().clone())
        .unwrap_or_default()
}

/// Run a future with a fresh collector and return its output together with
/// every dependency it recorded.
pub async fn with_collector<F, R>(f: F) -> (R, Observed)
where
    F: Future<Output = R>,
{
    DEPS.scope(RefCell::new(HashMap::new()), async move {
        let result = f.await;
        (result, collect())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ResourceId {
        s.parse().expect("valid id")
    }

    #[tokio::test]
    async fn record_without_collector_is_no_op() {
        record(&id("company#1"), 0);
        assert!(collect().is_empty());
    }

    #[tokio::test]
    async fn with_collector_captures_dependencies() {
        let (value, deps) = with_collector(async {
            record(&id("company#1"), 3);
            tokio::task::yield_now().await;
            record(&id("employee#7"), 0);
            42
        })
        .await;

        assert_eq!(value, 42);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps.get(&id("company#1")), Some(&3));
        assert_eq!(deps.get(&id("employee#7")), Some(&0));
    }

    #[tokio::test]
    async fn repeated_reads_keep_the_oldest_generation() {
        let (_, deps) = with_collector(async {
            record(&id("company#1"), 4);
            record(&id("company#1"), 9);
            record(&id("company#1"), 2);
        })
        .await;
        assert_eq!(deps.len(), 1);
        assert_eq!(deps.get(&id("company#1")), Some(&2));
    }

    #[tokio::test]
    async fn nested_collectors_are_isolated() {
        let (inner, outer) = with_collector(async {
            record(&id("company#1"), 1);
            let (_, inner) = with_collector(async {
                record(&id("employee#7"), 1);
            })
            .await;
            inner
        })
        .await;

        assert_eq!(inner.len(), 1);
        assert!(inner.contains_key(&id("employee#7")));
        assert_eq!(outer.len(), 1);
        assert!(outer.contains_key(&id("company#1")));
    }
}
