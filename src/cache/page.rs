//! Page artifact materialization.
//!
//! A cached page is a plain file under `root`, laid out so an upstream static
//! file server can answer the request without reaching the application:
//!
//! | request path | artifact            |
//! |--------------|---------------------|
//! | `/`          | `index.html`        |
//! | `/a/b`       | `a/b.html`          |
//! | `/a/`        | `a/index.html`      |
//! | `/feed.xml`  | `feed.xml`          |
//!
//! Each artifact may have a gzip sibling at `<artifact>.gz`. Query strings do
//! not participate, so requests differing only by query share one artifact.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::{CacheError, ResourceId};

use super::config::CacheConfig;
use super::events::InvalidationEvent;
use super::propagator::InvalidationSink;
use super::registry::ArtifactRegistry;

const METRIC_MATERIALIZE_TOTAL: &str = "cachet_page_materialize_total";
const METRIC_MATERIALIZE_FAILED_TOTAL: &str = "cachet_page_materialize_failed_total";
const METRIC_INVALIDATE_TOTAL: &str = "cachet_page_invalidate_total";
const GZIP_SUFFIX: &str = ".gz";
/// Temp files and the artifact index share this prefix; no page may use it.
const RESERVED_PREFIX: &str = ".cachet-";

/// Normalized request path addressing one page artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct PathKey(String);

impl PathKey {
    /// Strip query and fragment, collapse duplicate slashes and reject
    /// segments that could escape the artifact root.
    pub fn normalize(raw: &str) -> Result<Self, CacheError> {
        let path = raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim();
        if path.contains('\0') || path.contains('\\') {
            return Err(CacheError::invalid_path(raw, "illegal character"));
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| is_dot_segment(s)) {
            return Err(CacheError::invalid_path(raw, "dot segment"));
        }
        if segments.iter().any(|s| s.starts_with(RESERVED_PREFIX)) {
            return Err(CacheError::invalid_path(raw, "reserved segment"));
        }

        if segments.is_empty() {
            return Ok(Self("/".to_string()));
        }
        let mut normalized = format!("/{}", segments.join("/"));
        if path.ends_with('/') {
            normalized.push('/');
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Artifact location relative to the cache root.
    pub fn relative_file(&self) -> PathBuf {
        let trimmed = self.0.trim_start_matches('/');
        if trimmed.is_empty() {
            return PathBuf::from("index.html");
        }
        if trimmed.ends_with('/') {
            return Path::new(trimmed).join("index.html");
        }

        let mut file = PathBuf::from(trimmed);
        let has_extension = file
            .file_name()
            .and_then(|name| Path::new(name).extension())
            .is_some();
        if !has_extension {
            file.set_file_name(format!("{}.html", last_segment(trimmed)));
        }
        file
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PathKey> for String {
    fn from(value: PathKey) -> Self {
        value.0
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_dot_segment(segment: &str) -> bool {
    matches!(
        segment.to_ascii_lowercase().as_str(),
        "." | ".." | "%2e" | "%2e%2e" | ".%2e" | "%2e."
    )
}

/// Per-call materialization settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeOptions {
    /// Write a gzip sibling.
    pub gzip: bool,
    /// Bodies smaller than this get no sibling even when `gzip` is set.
    pub gzip_min_bytes: usize,
}

impl MaterializeOptions {
    pub fn plain() -> Self {
        Self {
            gzip: false,
            gzip_min_bytes: 0,
        }
    }

    pub fn gzip() -> Self {
        Self {
            gzip: true,
            gzip_min_bytes: 0,
        }
    }

    fn wants_gzip(&self, len: usize) -> bool {
        self.gzip && len >= self.gzip_min_bytes
    }
}

impl From<&CacheConfig> for MaterializeOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            gzip: config.gzip_artifacts,
            gzip_min_bytes: config.gzip_min_bytes,
        }
    }
}

/// What an upstream static server would serve for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLookup {
    Gzip(PathBuf),
    Plain(PathBuf),
    /// No artifact; the request reaches the application.
    Missing,
}

/// Writes and removes page artifacts and tracks which resources each was
/// rendered from.
///
/// The resource index is stored under the same root, so several processes
/// sharing the root (or one process after a restart) invalidate each other's
/// pages.
pub struct PageCacheMaterializer {
    root: PathBuf,
    defaults: MaterializeOptions,
    registry: Arc<ArtifactRegistry>,
}

impl PageCacheMaterializer {
    pub fn new(root: impl Into<PathBuf>, defaults: MaterializeOptions) -> Self {
        let root = root.into();
        let registry = Arc::new(ArtifactRegistry::open(&root));
        Self {
            root,
            defaults,
            registry,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.page_root.clone(), config.into())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn defaults(&self) -> MaterializeOptions {
        self.defaults
    }

    pub fn registry(&self) -> &Arc<ArtifactRegistry> {
        &self.registry
    }

    pub fn artifact_path(&self, path: &PathKey) -> PathBuf {
        self.root.join(path.relative_file())
    }

    pub fn gzip_path(&self, path: &PathKey) -> PathBuf {
        gzip_sibling(&self.artifact_path(path))
    }

    /// Write the artifact atomically, replacing any previous one.
    ///
    /// The gzip sibling is written before the main file. When no sibling is
    /// wanted, a stale one is removed before the main file is swapped in.
    pub async fn materialize(
        &self,
        path: &PathKey,
        body: Bytes,
        options: MaterializeOptions,
    ) -> Result<(), CacheError> {
        let started_at = Instant::now();
        let target = self.artifact_path(path);
        let gzip = options.wants_gzip(body.len());
        let body_len = body.len();

        let write_target = target.clone();
        let result = tokio::task::spawn_blocking(move || write_artifact(&write_target, &body, gzip))
            .await
            .unwrap_or_else(|join_err| Err(io::Error::other(join_err.to_string())));

        match result {
            Ok(()) => {
                counter!(METRIC_MATERIALIZE_TOTAL).increment(1);
                debug!(
                    path = %path,
                    artifact = %target.display(),
                    bytes = body_len,
                    gzip,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Page artifact materialized"
                );
                Ok(())
            }
            Err(source) => {
                counter!(METRIC_MATERIALIZE_FAILED_TOTAL).increment(1);
                Err(CacheError::artifact_write(target.display().to_string(), source))
            }
        }
    }

    /// Record the resources the page was rendered from, then materialize it.
    ///
    /// The index entry is written first: a crash in between leaves an entry
    /// without a file, never a file no touch can find.
    pub async fn materialize_for(
        &self,
        path: &PathKey,
        body: Bytes,
        resources: HashSet<ResourceId>,
    ) -> Result<(), CacheError> {
        let registered = path.clone();
        self.with_index(move |registry| registry.register(&registered, &resources))
            .await
            .map_err(|source| CacheError::artifact_write(path.as_str(), source))?;

        if let Err(err) = self.materialize(path, body, self.defaults).await {
            let stale = path.clone();
            if let Err(cleanup) = self.with_index(move |registry| registry.unregister(&stale)).await {
                warn!(path = %path, error = %cleanup, "Failed to drop index entry of unwritten page");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove the artifact and its sibling. Missing files are not an error.
    /// Returns true if anything was removed.
    ///
    /// The index entry is dropped only once the files are gone.
    pub async fn invalidate(&self, path: &PathKey) -> Result<bool, CacheError> {
        let removed = self.remove_files(path).await?;
        let unregistered = path.clone();
        self.with_index(move |registry| registry.unregister(&unregistered))
            .await
            .map_err(|source| CacheError::artifact_write(path.as_str(), source))?;
        Ok(removed)
    }

    /// Remove every artifact whose request path starts with `prefix`.
    /// Returns the number of files removed, siblings included.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let relative_prefix = prefix
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let root = self.root.clone();
        let path_prefix = format!("/{relative_prefix}");

        let removed = tokio::task::spawn_blocking(move || remove_matching(&root, &relative_prefix))
            .await
            .unwrap_or_else(|join_err| Err(io::Error::other(join_err.to_string())))
            .map_err(|source| CacheError::artifact_write(prefix, source))?;
        self.with_index(move |registry| registry.unregister_prefix(&path_prefix))
            .await
            .map_err(|source| CacheError::artifact_write(prefix, source))?;

        counter!(METRIC_INVALIDATE_TOTAL).increment(removed as u64);
        info!(prefix, removed, "Page artifacts invalidated by prefix");
        Ok(removed)
    }

    /// Resolve what a static server would send, preferring the gzip sibling
    /// when the client accepts it.
    pub async fn lookup(&self, path: &PathKey, accepts_gzip: bool) -> ArtifactLookup {
        let plain = self.artifact_path(path);
        if accepts_gzip {
            let gz = gzip_sibling(&plain);
            if tokio::fs::try_exists(&gz).await.unwrap_or(false) {
                return ArtifactLookup::Gzip(gz);
            }
        }
        if tokio::fs::try_exists(&plain).await.unwrap_or(false) {
            return ArtifactLookup::Plain(plain);
        }
        ArtifactLookup::Missing
    }

    async fn release(&self, resource: &ResourceId, path: &PathKey) -> Result<(), CacheError> {
        self.remove_files(path).await?;
        let (resource, released) = (resource.clone(), path.clone());
        self.with_index(move |registry| registry.release(&resource, &released))
            .await
            .map_err(|source| CacheError::artifact_write(path.as_str(), source))
    }

    async fn with_index<T, F>(&self, op: F) -> io::Result<T>
    where
        F: FnOnce(&ArtifactRegistry) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .unwrap_or_else(|join_err| Err(io::Error::other(join_err.to_string())))
    }

    async fn remove_files(&self, path: &PathKey) -> Result<bool, CacheError> {
        let plain = self.artifact_path(path);
        let gz = gzip_sibling(&plain);

        let mut removed = false;
        for file in [gz, plain] {
            match tokio::fs::remove_file(&file).await {
                Ok(()) => removed = true,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CacheError::artifact_write(file.display().to_string(), source));
                }
            }
        }
        if removed {
            counter!(METRIC_INVALIDATE_TOTAL).increment(1);
            debug!(path = %path, "Page artifact removed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl InvalidationSink for PageCacheMaterializer {
    fn name(&self) -> &'static str {
        "page_cache"
    }

    /// Removes every page indexed under the resource. A page stays indexed
    /// until its files are gone, so a failed removal is retried by the next
    /// touch.
    async fn on_invalidate(&self, event: &InvalidationEvent) -> Result<(), CacheError> {
        let resource = event.resource.clone();
        let paths = self
            .with_index(move |registry| registry.paths_for(&resource))
            .await
            .map_err(|source| CacheError::artifact_write(event.resource.to_string(), source))?;

        let mut last_error = None;
        for path in paths {
            if let Err(err) = self.release(&event.resource, &path).await {
                warn!(
                    path = %path,
                    resource = %event.resource,
                    error = %err,
                    "Failed to remove page artifact"
                );
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn gzip_sibling(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(GZIP_SUFFIX);
    PathBuf::from(name)
}

fn write_artifact(target: &Path, body: &[u8], gzip: bool) -> io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "artifact has no parent"))?;
    fs::create_dir_all(dir)?;

    let gz = gzip_sibling(target);
    if gzip {
        write_atomic(&gz, &compress(body)?)?;
    } else {
        match fs::remove_file(&gz) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    write_atomic(target, body)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "artifact has no parent"))?;
    let mut file = tempfile::Builder::new()
        .prefix(RESERVED_PREFIX)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;

    // Static servers run as a different user than the app.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
    }

    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn compress(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn remove_matching(root: &Path, relative_prefix: &str) -> io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    // Skips temp files and the whole index directory.
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with(RESERVED_PREFIX)
    });
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative.starts_with(relative_prefix) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(removed)
}
