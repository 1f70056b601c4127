use std::io;

use thiserror::Error;

use super::resource::ResourceId;

/// Failure reported by a cache store backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend operation `{op}` timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// A single invalidation side effect that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    pub resource: ResourceId,
    pub sink: &'static str,
    pub detail: String,
}

/// Errors surfaced by the caching core.
///
/// Read-path failures (`StoreUnavailable`) are recovered by callers that fail
/// open. `PropagationIncomplete` is a cache side-effect failure and never
/// implies the underlying data mutation failed.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key requested for a resource without a stable identity: {detail}")]
    InvalidResource { detail: String },
    #[error("cache store `{backend}` unavailable during `{op}`")]
    StoreUnavailable {
        backend: &'static str,
        op: &'static str,
        #[source]
        source: BackendError,
    },
    #[error(
        "invalidation from `{root}` touched {touched} resources but {} side effects failed",
        failures.len()
    )]
    PropagationIncomplete {
        root: ResourceId,
        touched: usize,
        failures: Vec<SinkFailure>,
    },
    #[error("failed to write page artifact `{path}`")]
    ArtifactWrite {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid page path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

impl CacheError {
    pub fn invalid_resource(detail: impl Into<String>) -> Self {
        Self::InvalidResource {
            detail: detail.into(),
        }
    }

    pub fn store_unavailable(backend: &'static str, op: &'static str, source: BackendError) -> Self {
        Self::StoreUnavailable {
            backend,
            op,
            source,
        }
    }

    pub fn artifact_write(path: impl Into<String>, source: io::Error) -> Self {
        Self::ArtifactWrite {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Returns true for errors that callers recover from by recomputing.
    pub fn is_fail_open(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::ArtifactWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagation_incomplete_reports_failure_count() {
        let root: ResourceId = "company#1".parse().expect("valid id");
        let err = CacheError::PropagationIncomplete {
            root: root.clone(),
            touched: 3,
            failures: vec![SinkFailure {
                resource: root,
                sink: "page_cache",
                detail: "permission denied".to_string(),
            }],
        };

        assert_eq!(
            err.to_string(),
            "invalidation from `company#1` touched 3 resources but 1 side effects failed"
        );
        assert!(!err.is_fail_open());
    }

    #[test]
    fn store_unavailable_is_fail_open() {
        let err = CacheError::store_unavailable(
            "memory",
            "get",
            BackendError::Timeout {
                op: "get",
                timeout_ms: 50,
            },
        );
        assert!(err.is_fail_open());
    }
}
