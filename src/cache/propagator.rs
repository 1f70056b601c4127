//! Touch propagation.
//!
//! A touch bumps a resource's generation and walks the dependency graph
//! breadth-first, bumping every reachable dependent exactly once. Each bump is
//! delivered to the registered sinks before the call returns, so a request
//! issued after `touch` completes never sees stale output.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::{error, info, instrument, warn};

use crate::domain::{CacheError, ResourceId, SinkFailure};

use super::events::{EventJournal, EventKind, InvalidationEvent};
use super::graph::DependencyGraph;
use super::lock::{rw_read, rw_write};
use super::planner::PropagationPlan;
use super::versions::VersionRegistry;

const SOURCE: &str = "cache::propagator";
const METRIC_TOUCH_TOTAL: &str = "cachet_touch_total";
const METRIC_PROPAGATION_MS: &str = "cachet_propagation_ms";

/// Receiver of invalidation side effects (artifact deletion, fragment purges).
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    /// Short stable name used in logs and failure reports.
    fn name(&self) -> &'static str;

    async fn on_invalidate(&self, event: &InvalidationEvent) -> Result<(), CacheError>;
}

/// Outcome of a successful propagation pass.
#[derive(Debug, Clone)]
pub struct TouchReport {
    /// Every resource whose generation advanced, in plan order.
    pub touched: Vec<ResourceId>,
    pub cycle_detected: bool,
}

impl TouchReport {
    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    pub fn contains(&self, resource: &ResourceId) -> bool {
        self.touched.contains(resource)
    }
}

pub struct InvalidationPropagator {
    graph: Arc<DependencyGraph>,
    versions: Arc<VersionRegistry>,
    journal: Arc<EventJournal>,
    sinks: RwLock<Vec<Arc<dyn InvalidationSink>>>,
}

impl InvalidationPropagator {
    pub fn new(
        graph: Arc<DependencyGraph>,
        versions: Arc<VersionRegistry>,
        journal: Arc<EventJournal>,
    ) -> Self {
        Self {
            graph,
            versions,
            journal,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn InvalidationSink>) {
        info!(sink = sink.name(), "Invalidation sink registered");
        rw_write(&self.sinks, SOURCE, "register_sink").push(sink);
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn versions(&self) -> &Arc<VersionRegistry> {
        &self.versions
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    /// Touch one resource and everything that depends on it.
    pub async fn touch(&self, resource: &ResourceId) -> Result<TouchReport, CacheError> {
        self.propagate(std::slice::from_ref(resource), EventKind::Touched)
            .await
    }

    /// Touch several roots in a single pass. A resource reachable from more
    /// than one root is still touched once.
    pub async fn touch_all(&self, resources: &[ResourceId]) -> Result<TouchReport, CacheError> {
        self.propagate(resources, EventKind::Touched).await
    }

    /// Propagate the removal of a resource.
    ///
    /// The root is reported as `Deleted`, its dependents as `Touched`. Edges
    /// of the removed resource are dropped afterwards, whether or not every
    /// sink succeeded.
    pub async fn delete(&self, resource: &ResourceId) -> Result<TouchReport, CacheError> {
        let result = self
            .propagate(std::slice::from_ref(resource), EventKind::Deleted)
            .await;
        self.graph.forget(resource);
        result
    }

    #[instrument(skip(self, roots), fields(roots = roots.len(), kind = ?root_kind))]
    async fn propagate(
        &self,
        roots: &[ResourceId],
        root_kind: EventKind,
    ) -> Result<TouchReport, CacheError> {
        let started_at = Instant::now();
        let Some(first_root) = roots.first().cloned() else {
            return Ok(TouchReport {
                touched: Vec::new(),
                cycle_detected: false,
            });
        };

        let plan = PropagationPlan::build(&self.graph, roots);
        if plan.cycle_detected {
            warn!(
                root = %first_root,
                plan = %plan,
                "Dependency cycle encountered during propagation"
            );
        }

        let sinks: Vec<Arc<dyn InvalidationSink>> =
            rw_read(&self.sinks, SOURCE, "propagate").clone();
        let mut failures = Vec::new();
        let mut touched = Vec::with_capacity(plan.len());

        for step in &plan.steps {
            let state = self.versions.touch(&step.resource);
            counter!(METRIC_TOUCH_TOTAL).increment(1);

            let kind = if step.depth == 0 {
                root_kind
            } else {
                EventKind::Touched
            };
            let root = if step.depth == 0 {
                step.resource.clone()
            } else {
                first_root.clone()
            };
            let event = InvalidationEvent::new(
                kind,
                self.journal.next_epoch(),
                step.resource.clone(),
                root,
                step.depth,
                state.generation,
            );

            for sink in &sinks {
                if let Err(err) = sink.on_invalidate(&event).await {
                    warn!(
                        sink = sink.name(),
                        resource = %event.resource,
                        error = %err,
                        "Invalidation sink failed"
                    );
                    failures.push(SinkFailure {
                        resource: event.resource.clone(),
                        sink: sink.name(),
                        detail: err.to_string(),
                    });
                }
            }

            self.journal.record(event);
            touched.push(step.resource.clone());
        }

        histogram!(METRIC_PROPAGATION_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        if !failures.is_empty() {
            error!(
                error_code = "propagation_incomplete",
                root = %first_root,
                touched = touched.len(),
                failures = failures.len(),
                "Propagation finished with failed side effects"
            );
            return Err(CacheError::PropagationIncomplete {
                root: first_root,
                touched: touched.len(),
                failures,
            });
        }

        info!(
            root = %first_root,
            touched = touched.len(),
            max_depth = plan.max_depth(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Propagation complete"
        );

        Ok(TouchReport {
            touched,
            cycle_detected: plan.cycle_detected,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn id(s: &str) -> ResourceId {
        s.parse().expect("valid id")
    }

    fn propagator() -> InvalidationPropagator {
        InvalidationPropagator::new(
            Arc::new(DependencyGraph::new()),
            Arc::new(VersionRegistry::new()),
            Arc::new(EventJournal::new(64)),
        )
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(ResourceId, EventKind)>>,
    }

    #[async_trait]
    impl InvalidationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn on_invalidate(&self, event: &InvalidationEvent) -> Result<(), CacheError> {
            self.events
                .lock()
                .expect("sink lock")
                .push((event.resource.clone(), event.kind));
            Ok(())
        }
    }

    struct FailingSink {
        target: ResourceId,
    }

    #[async_trait]
    impl InvalidationSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn on_invalidate(&self, event: &InvalidationEvent) -> Result<(), CacheError> {
            if event.resource == self.target {
                return Err(CacheError::artifact_write(
                    "companies/1.html",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                ));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn touch_bumps_root_and_dependents() {
        let propagator = propagator();
        let employee = id("employee#7");
        let company = id("company#1");
        propagator.graph().declare_dependency(&company, &employee);

        let before = propagator.versions().current(&company).generation;
        let report = propagator.touch(&employee).await.expect("touch");

        assert_eq!(report.touched, vec![employee.clone(), company.clone()]);
        assert!(propagator.versions().current(&company).generation > before);
        assert!(propagator.versions().current(&employee).generation > 0);
        assert_eq!(propagator.journal().len(), 2);
    }

    #[tokio::test]
    async fn sinks_receive_events_in_plan_order() {
        let propagator = propagator();
        let sink = Arc::new(RecordingSink::default());
        propagator.register_sink(sink.clone());

        let employee = id("employee#7");
        let company = id("company#1");
        let directory = id("directory#main");
        propagator.graph().declare_dependency(&company, &employee);
        propagator.graph().declare_dependency(&directory, &company);

        propagator.touch(&employee).await.expect("touch");

        let events = sink.events.lock().expect("sink lock").clone();
        assert_eq!(
            events,
            vec![
                (employee, EventKind::Touched),
                (company, EventKind::Touched),
                (directory, EventKind::Touched),
            ]
        );
    }

    #[tokio::test]
    async fn cycles_terminate_with_each_member_touched_once() {
        let propagator = propagator();
        let a = id("node#a");
        let b = id("node#b");
        let c = id("node#c");
        propagator.graph().declare_dependency(&b, &a);
        propagator.graph().declare_dependency(&c, &b);
        propagator.graph().declare_dependency(&a, &c);

        let report = propagator.touch(&a).await.expect("touch");
        assert_eq!(report.touched_count(), 3);
        assert!(report.cycle_detected);
    }

    #[tokio::test]
    async fn touch_all_merges_roots() {
        let propagator = propagator();
        let company = id("company#1");
        let e1 = id("employee#1");
        let e2 = id("employee#2");
        propagator.graph().declare_dependency(&company, &e1);
        propagator.graph().declare_dependency(&company, &e2);

        let report = propagator
            .touch_all(&[e1.clone(), e2.clone()])
            .await
            .expect("touch_all");
        assert_eq!(report.touched_count(), 3);
        assert_eq!(
            report.touched.iter().filter(|r| **r == company).count(),
            1
        );
    }

    #[tokio::test]
    async fn touch_all_with_no_roots_is_empty() {
        let report = propagator().touch_all(&[]).await.expect("touch_all");
        assert_eq!(report.touched_count(), 0);
    }

    #[tokio::test]
    async fn delete_marks_root_and_forgets_edges() {
        let propagator = propagator();
        let sink = Arc::new(RecordingSink::default());
        propagator.register_sink(sink.clone());

        let company = id("company#1");
        let directory = id("directory#main");
        propagator.graph().declare_dependency(&directory, &company);

        propagator.delete(&company).await.expect("delete");

        let events = sink.events.lock().expect("sink lock").clone();
        assert_eq!(events[0], (company.clone(), EventKind::Deleted));
        assert_eq!(events[1], (directory, EventKind::Touched));
        assert!(propagator.graph().dependents_of(&company).is_empty());
    }

    #[tokio::test]
    async fn sink_failure_reports_incomplete_but_still_bumps_everything() {
        let propagator = propagator();
        let employee = id("employee#7");
        let company = id("company#1");
        let directory = id("directory#main");
        propagator.graph().declare_dependency(&company, &employee);
        propagator.graph().declare_dependency(&directory, &company);
        propagator.register_sink(Arc::new(FailingSink {
            target: company.clone(),
        }));

        let err = propagator
            .touch(&employee)
            .await
            .expect_err("sink failure should surface");

        match err {
            CacheError::PropagationIncomplete {
                root,
                touched,
                failures,
            } => {
                assert_eq!(root, employee);
                assert_eq!(touched, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].resource, company);
                assert_eq!(failures[0].sink, "failing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(propagator.versions().current(&directory).generation > 0);
    }
}
