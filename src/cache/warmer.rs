//! Cache pre-warming.
//!
//! Issues synthetic GET requests so page artifacts exist before real traffic
//! arrives. Requests go either through an in-process router or to a running
//! server over HTTP.

use std::collections::HashSet;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use metrics::histogram;
use serde::Serialize;
use thiserror::Error;
use tower::ServiceExt;
use tracing::{info, warn};
use url::Url;

use super::middleware::WARM_HEADER;
use super::page::PathKey;

const METRIC_WARM_MS: &str = "cachet_warm_ms";

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("invalid warm base url `{url}`: {detail}")]
    InvalidBaseUrl { url: String, detail: String },
    #[error("warm request for `{path}` failed: {detail}")]
    Request { path: String, detail: String },
    #[error("warm request for `{path}` returned status {status}")]
    Status { path: String, status: u16 },
}

/// Where warm-up requests are sent.
#[derive(Clone)]
pub enum WarmTarget {
    /// Dispatch through the application router without a socket.
    Router(Router),
    /// Send to a running server.
    Remote { client: reqwest::Client, base_url: Url },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WarmFailure {
    pub path: String,
    pub detail: String,
}

/// Summary of one warm-up run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmReport {
    /// Distinct normalized paths attempted.
    pub requested: usize,
    pub warmed: Vec<String>,
    pub failed: Vec<WarmFailure>,
    /// Inputs rejected by path normalization.
    pub invalid: Vec<String>,
    pub elapsed_ms: u64,
}

impl WarmReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.invalid.is_empty()
    }
}

pub struct CacheWarmer {
    target: WarmTarget,
    concurrency: usize,
}

impl CacheWarmer {
    pub fn new(target: WarmTarget, concurrency: usize) -> Self {
        Self {
            target,
            concurrency: concurrency.max(1),
        }
    }

    pub fn in_process(router: Router, concurrency: usize) -> Self {
        Self::new(WarmTarget::Router(router), concurrency)
    }

    pub fn remote(base_url: &str, concurrency: usize) -> Result<Self, WarmError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url = Url::parse(&normalized).map_err(|err| WarmError::InvalidBaseUrl {
            url: base_url.to_string(),
            detail: err.to_string(),
        })?;
        Ok(Self::new(
            WarmTarget::Remote {
                client: reqwest::Client::new(),
                base_url,
            },
            concurrency,
        ))
    }

    /// Warm every path once, at most `concurrency` at a time.
    pub async fn warm<I, S>(&self, paths: I) -> WarmReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let started_at = Instant::now();
        let mut report = WarmReport::default();
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for raw in paths {
            let raw = raw.as_ref();
            match PathKey::normalize(raw) {
                Ok(path) => {
                    if seen.insert(path.clone()) {
                        targets.push(path);
                    }
                }
                Err(err) => {
                    warn!(path = raw, error = %err, "Skipping invalid warm path");
                    report.invalid.push(raw.to_string());
                }
            }
        }
        report.requested = targets.len();

        let results: Vec<(PathKey, Result<(), WarmError>)> = stream::iter(targets)
            .map(|path| async move {
                let result = self.warm_one(&path).await;
                (path, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (path, result) in results {
            match result {
                Ok(()) => report.warmed.push(path.to_string()),
                Err(err) => {
                    warn!(path = %path, error = %err, "Warm request failed");
                    report.failed.push(WarmFailure {
                        path: path.to_string(),
                        detail: err.to_string(),
                    });
                }
            }
        }
        report.warmed.sort();

        let elapsed = started_at.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        histogram!(METRIC_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);
        info!(
            requested = report.requested,
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            invalid = report.invalid.len(),
            elapsed_ms = report.elapsed_ms,
            "Cache warm-up complete"
        );
        report
    }

    async fn warm_one(&self, path: &PathKey) -> Result<(), WarmError> {
        match &self.target {
            WarmTarget::Router(router) => {
                let request = Request::builder()
                    .uri(path.as_str())
                    .header(WARM_HEADER, "1")
                    .body(Body::empty())
                    .map_err(|err| WarmError::Request {
                        path: path.to_string(),
                        detail: err.to_string(),
                    })?;
                let response = router
                    .clone()
                    .oneshot(request)
                    .await
                    .map_err(|err| WarmError::Request {
                        path: path.to_string(),
                        detail: err.to_string(),
                    })?;
                let status = response.status();
                response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|err| WarmError::Request {
                        path: path.to_string(),
                        detail: err.to_string(),
                    })?;
                check_status(path, status)
            }
            WarmTarget::Remote { client, base_url } => {
                let url = base_url
                    .join(path.as_str().trim_start_matches('/'))
                    .map_err(|err| WarmError::Request {
                        path: path.to_string(),
                        detail: err.to_string(),
                    })?;
                let response = client
                    .get(url)
                    .header(WARM_HEADER, "1")
                    .send()
                    .await
                    .map_err(|err| WarmError::Request {
                        path: path.to_string(),
                        detail: err.to_string(),
                    })?;
                let status = response.status();
                response.bytes().await.map_err(|err| WarmError::Request {
                    path: path.to_string(),
                    detail: err.to_string(),
                })?;
                check_status(path, status)
            }
        }
    }
}

fn check_status(path: &PathKey, status: StatusCode) -> Result<(), WarmError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(WarmError::Status {
            path: path.to_string(),
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::get;

    use super::*;

    fn counting_router(hits: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/companies/{id}",
                get(
                    |State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap| async move {
                        assert_eq!(headers[WARM_HEADER], "1");
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    },
                ),
            )
            .with_state(hits)
    }

    #[tokio::test]
    async fn warms_each_distinct_path_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let warmer = CacheWarmer::in_process(counting_router(Arc::clone(&hits)), 2);

        let report = warmer
            .warm(["/companies/1", "/companies/1?x=1", "//companies//2", "/companies/3"])
            .await;

        assert_eq!(report.requested, 3);
        assert_eq!(
            report.warmed,
            vec!["/companies/1", "/companies/2", "/companies/3"]
        );
        assert!(report.is_success());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_and_invalid_paths_are_reported() {
        let hits = Arc::new(AtomicUsize::new(0));
        let warmer = CacheWarmer::in_process(counting_router(hits), 4);

        let report = warmer.warm(["/missing", "/../secret"]).await;

        assert_eq!(report.requested, 1);
        assert_eq!(report.invalid, vec!["/../secret".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "/missing");
        assert!(report.failed[0].detail.contains("404"));
        assert!(!report.is_success());
    }

    #[test]
    fn remote_base_url_is_validated() {
        assert!(CacheWarmer::remote("http://localhost:3000", 4).is_ok());
        assert!(matches!(
            CacheWarmer::remote("not a url", 4),
            Err(WarmError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let warmer = CacheWarmer::in_process(Router::new(), 0);
        assert_eq!(warmer.concurrency, 1);
    }
}
