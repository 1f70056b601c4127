//! Cache service.
//!
//! Wires the cache components together and exposes the operations the rest of
//! an application calls after writes (touch, delete) and during
//! administration (purge).

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{BackendError, CacheError, ResourceId};

use super::backend::{CacheStoreBackend, build_backend};
use super::conditional::ConditionalEvaluator;
use super::config::CacheConfig;
use super::events::EventJournal;
use super::graph::DependencyGraph;
use super::keys::KeyGenerator;
use super::middleware::PageCacheState;
use super::page::PageCacheMaterializer;
use super::propagator::{InvalidationPropagator, TouchReport};
use super::store::FragmentCacheStore;
use super::versions::VersionRegistry;

const JOURNAL_CAPACITY: usize = 512;

/// What an administrative purge removes.
///
/// Fragment keys (`views/company/...`) and page paths (`/companies/...`) are
/// separate namespaces, so each tier gets its own prefix. `None` leaves the
/// tier alone; an empty prefix clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeScope {
    pub fragment_prefix: Option<String>,
    pub path_prefix: Option<String>,
}

impl PurgeScope {
    pub fn everything() -> Self {
        Self {
            fragment_prefix: Some(String::new()),
            path_prefix: Some(String::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragment_prefix.is_none() && self.path_prefix.is_none()
    }
}

/// Counts removed by an administrative purge; `None` for a tier outside the
/// scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub fragments: Option<usize>,
    pub artifacts: Option<usize>,
}

/// Every cache component, built once per process and shared by handlers.
pub struct CacheService {
    config: CacheConfig,
    keys: KeyGenerator,
    propagator: Arc<InvalidationPropagator>,
    fragments: FragmentCacheStore,
    pages: Arc<PageCacheMaterializer>,
    evaluator: ConditionalEvaluator,
}

impl CacheService {
    /// Build the configured backend and assemble the service around it.
    pub async fn connect(config: CacheConfig) -> Result<Self, BackendError> {
        let backend = build_backend(&config).await?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheStoreBackend>) -> Self {
        let versions = Arc::new(VersionRegistry::new());
        let graph = Arc::new(DependencyGraph::new());
        let journal = Arc::new(EventJournal::new(JOURNAL_CAPACITY));
        let propagator = Arc::new(InvalidationPropagator::new(
            graph,
            Arc::clone(&versions),
            journal,
        ));

        let pages = Arc::new(PageCacheMaterializer::from_config(&config));
        if config.enable_page_cache {
            propagator.register_sink(pages.clone());
        }

        info!(
            namespace = %config.namespace,
            backend = backend.name(),
            fragment_cache = config.enable_fragment_cache,
            page_cache = config.enable_page_cache,
            page_root = %config.page_root.display(),
            "Cache service ready"
        );

        Self {
            keys: KeyGenerator::new(config.namespace.clone(), versions),
            fragments: FragmentCacheStore::new(backend, &config),
            evaluator: ConditionalEvaluator::new(config.policy.clone()),
            propagator,
            pages,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyGenerator {
        &self.keys
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        self.propagator.graph()
    }

    pub fn versions(&self) -> &Arc<VersionRegistry> {
        self.propagator.versions()
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        self.propagator.journal()
    }

    pub fn propagator(&self) -> &Arc<InvalidationPropagator> {
        &self.propagator
    }

    pub fn fragments(&self) -> &FragmentCacheStore {
        &self.fragments
    }

    pub fn pages(&self) -> &Arc<PageCacheMaterializer> {
        &self.pages
    }

    pub fn evaluator(&self) -> &ConditionalEvaluator {
        &self.evaluator
    }

    /// State for [`super::page_cache_layer`].
    pub fn page_cache_state(&self) -> PageCacheState {
        PageCacheState {
            materializer: Arc::clone(&self.pages),
            versions: Arc::clone(self.versions()),
            enabled: self.config.enable_page_cache,
            max_body_bytes: self.config.max_body_bytes,
        }
    }

    /// Record that `resource` was mutated. Call after the write commits.
    pub async fn touch(&self, resource: &ResourceId) -> Result<TouchReport, CacheError> {
        debug!(resource = %resource, "Cache touch requested");
        self.propagator.touch(resource).await
    }

    pub async fn touch_all(&self, resources: &[ResourceId]) -> Result<TouchReport, CacheError> {
        self.propagator.touch_all(resources).await
    }

    /// Record that `resource` was removed.
    ///
    /// Its generation stays registered as a tombstone; only its graph edges
    /// are dropped.
    pub async fn delete(&self, resource: &ResourceId) -> Result<TouchReport, CacheError> {
        debug!(resource = %resource, "Cache delete requested");
        self.propagator.delete(resource).await
    }

    /// Remove fragments whose key starts with `scope.fragment_prefix` and
    /// page artifacts whose request path starts with `scope.path_prefix`.
    pub async fn purge(&self, scope: &PurgeScope) -> Result<PurgeReport, CacheError> {
        let mut report = PurgeReport::default();
        if let Some(prefix) = &scope.fragment_prefix {
            report.fragments = Some(self.fragments.delete_by_prefix(prefix).await?);
        }
        if let Some(prefix) = &scope.path_prefix {
            report.artifacts = Some(self.pages.invalidate_prefix(prefix).await?);
        }
        info!(
            fragment_prefix = ?scope.fragment_prefix,
            path_prefix = ?scope.path_prefix,
            fragments = ?report.fragments,
            artifacts = ?report.artifacts,
            "Cache purge complete"
        );
        Ok(report)
    }
}
