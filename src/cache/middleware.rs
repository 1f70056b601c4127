//! Page cache capture middleware.
//!
//! Handlers opt in by attaching the [`CachePage`] extension to a response.
//! Matching GET responses are buffered, written as page artifacts and linked
//! to the resources whose keys were derived while the handler ran.
//!
//! A page is only kept if none of those resources was touched after its key
//! was derived. The check runs before the write and again after the index
//! entry exists, so a touch racing the render either sees the entry or is
//! seen by the second check.

use std::sync::Arc;

use axum::{
    Extension,
    body::{Body, HttpBody},
    extract::State,
    http::{Method, Request, StatusCode, header::SET_COOKIE},
    middleware::Next,
    response::{IntoResponseParts, Response, ResponseParts},
};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::deps;
use super::page::{PageCacheMaterializer, PathKey};
use super::versions::VersionRegistry;

/// Request header marking synthetic warm-up requests.
pub const WARM_HEADER: &str = "x-cachet-warm";

/// Response marker: materialize this response as a page artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct CachePage;

impl IntoResponseParts for CachePage {
    type Error = std::convert::Infallible;

    fn into_response_parts(self, res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        Extension(self).into_response_parts(res)
    }
}

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    pub materializer: Arc<PageCacheMaterializer>,
    pub versions: Arc<VersionRegistry>,
    pub enabled: bool,
    pub max_body_bytes: usize,
}

impl PageCacheState {
    pub fn new(
        materializer: Arc<PageCacheMaterializer>,
        versions: Arc<VersionRegistry>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            materializer,
            versions,
            enabled: true,
            max_body_bytes,
        }
    }
}

#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(state): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.enabled || request.method() != Method::GET {
        return next.run(request).await;
    }

    let Ok(path) = PathKey::normalize(request.uri().path()) else {
        return next.run(request).await;
    };
    let warm = request.headers().contains_key(WARM_HEADER);

    let (response, observed) = deps::with_collector(next.run(request)).await;

    if response.status() != StatusCode::OK
        || response.extensions().get::<CachePage>().is_none()
        || response.headers().contains_key(SET_COOKIE)
    {
        return response;
    }

    // Streaming bodies of unknown length are passed through untouched.
    let within_limit = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= state.max_body_bytes as u64);
    if !within_limit {
        debug!(path = %path, "Response body too large or unbounded; not materialized");
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(path = %path, error = %err, "Failed to buffer response body");
            return Response::from_parts(parts, Body::empty());
        }
    };

    if state.versions.any_advanced(&observed) {
        debug!(path = %path, "Dependency touched during render; not materialized");
        return Response::from_parts(parts, Body::from(bytes));
    }

    let resources = observed.keys().cloned().collect();
    match state
        .materializer
        .materialize_for(&path, bytes.clone(), resources)
        .await
    {
        Ok(()) if state.versions.any_advanced(&observed) => {
            debug!(path = %path, "Dependency touched during write; artifact dropped");
            if let Err(err) = state.materializer.invalidate(&path).await {
                warn!(
                    path = %path,
                    error_code = "artifact_write",
                    error = %err,
                    "Failed to drop stale page artifact"
                );
            }
        }
        Ok(()) => debug!(
            path = %path,
            deps_count = observed.len(),
            warm,
            "Page captured"
        ),
        Err(err) => warn!(
            path = %path,
            error_code = "artifact_write",
            error = %err,
            "Failed to materialize page; serving response anyway"
        ),
    }

    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use bytes::Bytes;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::page::MaterializeOptions;
    use crate::domain::ResourceId;

    fn state(dir: &TempDir) -> PageCacheState {
        let materializer = PageCacheMaterializer::new(dir.path(), MaterializeOptions::plain());
        PageCacheState::new(Arc::new(materializer), Arc::new(VersionRegistry::new()), 1024)
    }

    fn company() -> ResourceId {
        "company#1".parse().expect("valid id")
    }

    fn app(state: PageCacheState) -> Router {
        let versions = Arc::clone(&state.versions);
        Router::new()
            .route(
                "/companies/{id}",
                get(|| async {
                    deps::record(&company(), 0);
                    (CachePage, "<p>Acme</p>")
                }),
            )
            .route(
                "/racing",
                get(move || async move {
                    let id = company();
                    deps::record(&id, versions.current(&id).generation);
                    // A write commits while the page is still rendering.
                    versions.touch(&id);
                    (CachePage, "<p>Acme (old)</p>")
                }),
            )
            .route("/dynamic", get(|| async { "not cached" }))
            .route(
                "/big",
                get(|| async { (CachePage, "x".repeat(4096)) }),
            )
            .route(
                "/cookie",
                get(|| async {
                    (
                        CachePage,
                        [(SET_COOKIE, "session=abc")],
                        "personal",
                    )
                }),
            )
            .layer(middleware::from_fn_with_state(state, page_cache_layer))
    }

    async fn get_path(app: Router, path: &str) -> Response {
        app.oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response")
    }

    #[tokio::test]
    async fn marked_response_is_materialized_and_registered() {
        let dir = TempDir::new().expect("tempdir");
        let state = state(&dir);
        let registry = Arc::clone(state.materializer.registry());

        let response = get_path(app(state), "/companies/1?tab=people").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from_static(b"<p>Acme</p>"));

        let artifact = dir.path().join("companies/1.html");
        assert_eq!(std::fs::read(artifact).expect("artifact"), b"<p>Acme</p>");

        let paths = registry.paths_for(&company()).expect("paths");
        assert!(paths.contains(&PathKey::normalize("/companies/1").expect("path")));
    }

    #[tokio::test]
    async fn page_rendered_across_a_touch_is_not_materialized() {
        let dir = TempDir::new().expect("tempdir");
        let state = state(&dir);
        let registry = Arc::clone(state.materializer.registry());

        let response = get_path(app(state), "/racing").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from_static(b"<p>Acme (old)</p>"));

        assert!(!dir.path().join("racing.html").exists());
        assert!(registry.paths_for(&company()).expect("paths").is_empty());
    }

    #[tokio::test]
    async fn unmarked_response_is_not_materialized() {
        let dir = TempDir::new().expect("tempdir");
        let response = get_path(app(state(&dir)), "/dynamic").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!dir.path().join("dynamic.html").exists());
    }

    #[tokio::test]
    async fn oversized_body_is_passed_through() {
        let dir = TempDir::new().expect("tempdir");
        let response = get_path(app(state(&dir)), "/big").await;
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body.len(), 4096);
        assert!(!dir.path().join("big.html").exists());
    }

    #[tokio::test]
    async fn responses_setting_cookies_are_not_materialized() {
        let dir = TempDir::new().expect("tempdir");
        let response = get_path(app(state(&dir)), "/cookie").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!dir.path().join("cookie.html").exists());
    }

    #[tokio::test]
    async fn non_get_requests_pass_through() {
        let dir = TempDir::new().expect("tempdir");
        let response = app(state(&dir))
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/companies/1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(!dir.path().join("companies/1.html").exists());
    }

    #[tokio::test]
    async fn disabled_state_skips_capture() {
        let dir = TempDir::new().expect("tempdir");
        let mut state = state(&dir);
        state.enabled = false;
        get_path(app(state), "/companies/1").await;
        assert!(!dir.path().join("companies/1.html").exists());
    }
}
