//! Cachet cache system.
//!
//! Four cooperating tiers for dynamically generated content:
//!
//! - **Keys**: version-sensitive fingerprints for resources and collections
//! - **Fragments**: rendered byte blobs in a pluggable store
//! - **Conditional GET**: `ETag` / `Last-Modified` validation and 304s
//! - **Pages**: materialized artifacts served by an upstream static server
//!
//! Mutations are announced with [`CacheService::touch`], which propagates
//! through the [`DependencyGraph`] and removes stale artifacts before it
//! returns.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! namespace = "views"
//! memory_capacity = 1024
//! store_timeout_ms = 250
//!
//! [page_cache]
//! root = "public/cache"
//! gzip = true
//! ```

pub mod admin;
mod artifacts;
pub mod backend;
mod conditional;
mod config;
pub mod deps;
mod events;
mod graph;
mod keys;
mod lock;
mod middleware;
mod page;
mod planner;
mod propagator;
mod registry;
mod service;
mod store;
mod versions;
mod warmer;

pub use artifacts::{ArtifactState, build_artifact_router};
pub use backend::{CacheEntry, CacheStoreBackend, MemoryBackend, RedisBackend, build_backend};
pub use conditional::{
    CachePolicy, ConditionalEvaluator, ConditionalValidators, Evaluation, Freshness,
    RequestValidators, evaluate, format_http_date, parse_http_date, respond_conditionally,
};
pub use config::{BackendKind, CacheConfig};
pub use events::{Epoch, EventJournal, EventKind, InvalidationEvent};
pub use graph::{DependencyGraph, EdgeKind};
pub use keys::{CacheKey, KeyContext, KeyGenerator};
pub use middleware::{CachePage, PageCacheState, WARM_HEADER, page_cache_layer};
pub use page::{ArtifactLookup, MaterializeOptions, PageCacheMaterializer, PathKey};
pub use planner::{PlannedTouch, PropagationPlan};
pub use propagator::{InvalidationPropagator, InvalidationSink, TouchReport};
pub use registry::ArtifactRegistry;
pub use service::{CacheService, PurgeReport, PurgeScope};
pub use store::FragmentCacheStore;
pub use versions::{VersionRegistry, VersionState};
pub use warmer::{CacheWarmer, WarmError, WarmFailure, WarmReport, WarmTarget};
