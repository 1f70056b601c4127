//! Serves materialized page artifacts the way an upstream static server
//! would: gzip sibling when accepted, plain artifact otherwise, 404 when
//! nothing has been materialized yet.

use std::path::Path;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use mime_guess::Mime;
use tracing::{debug, warn};

use super::conditional::CachePolicy;
use super::page::{ArtifactLookup, PageCacheMaterializer, PathKey};

#[derive(Clone)]
pub struct ArtifactState {
    pub pages: Arc<PageCacheMaterializer>,
    pub policy: CachePolicy,
}

/// Router answering every GET from the artifact root.
pub fn build_artifact_router(state: ArtifactState) -> Router {
    Router::new().fallback(serve_artifact).with_state(state)
}

async fn serve_artifact(
    State(state): State<ArtifactState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let raw = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or_else(|| uri.path());
    let path = match PathKey::normalize(raw) {
        Ok(path) => path,
        Err(err) => {
            debug!(path = raw, error = %err, "Rejected artifact path");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let accepts_gzip = accepts_gzip(&headers);
    let (file, encoded) = match state.pages.lookup(&path, accepts_gzip).await {
        ArtifactLookup::Gzip(file) => (file, true),
        ArtifactLookup::Plain(file) => (file, false),
        ArtifactLookup::Missing => return StatusCode::NOT_FOUND.into_response(),
    };

    match tokio::fs::read(&file).await {
        Ok(contents) => {
            let served = state.pages.artifact_path(&path);
            build_response(
                Bytes::from(contents),
                content_type(&served),
                encoded,
                &state.policy,
            )
        }
        // Raced with an invalidation between lookup and read.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            warn!(path = %path, file = %file.display(), error = %err, "Failed to read page artifact");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| {
            let mut parts = coding.split(';').map(str::trim);
            let name = parts.next().unwrap_or_default();
            let rejected = parts.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            });
            !rejected && (name.eq_ignore_ascii_case("gzip") || name == "*")
        })
}

fn content_type(path: &Path) -> Mime {
    mime_guess::from_path(path).first_or_octet_stream()
}

fn build_response(bytes: Bytes, mime: Mime, encoded: bool, policy: &CachePolicy) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if encoded {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    headers.insert(header::VARY, HeaderValue::from_static("accept-encoding"));
    if let Ok(value) = HeaderValue::from_str(&policy.header_value()) {
        headers.insert(header::CACHE_CONTROL, value);
    }

    response
}
