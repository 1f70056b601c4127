//! Bidirectional resource/artifact index, kept on disk.
//!
//! Records which resources each materialized page was rendered from, so a
//! touch on any of them can find the files to remove. The index lives under
//! `<page_root>/.cachet-index/` next to the artifacts it describes, which
//! makes it visible to every process sharing the root and lets it survive
//! restarts:
//!
//! ```text
//! .cachet-index/paths/<path digest>.json               {"path": ..., "resources": [...]}
//! .cachet-index/resources/<resource digest>/<path digest>   request path
//! ```
//!
//! All methods do blocking file I/O; async callers go through
//! `spawn_blocking`.

use std::collections::HashSet;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::domain::ResourceId;

use super::lock::mutex_lock;
use super::page::{PathKey, write_atomic};

const SOURCE: &str = "cache::registry";
/// Directory under the page root holding the index. Starts with the reserved
/// prefix, so it is never addressable as a page.
pub(crate) const INDEX_DIR: &str = ".cachet-index";
const PATHS_DIR: &str = "paths";
const RESOURCES_DIR: &str = "resources";
const MANIFEST_EXT: &str = "json";
const DIGEST_LEN: usize = 32;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    path: String,
    resources: Vec<ResourceId>,
}

/// Tracks resource -> pages and page -> resources mappings.
pub struct ArtifactRegistry {
    index: PathBuf,
    // Serializes this process's writers; other processes may interleave.
    writes: Mutex<()>,
}

impl ArtifactRegistry {
    /// Index for the artifacts under `page_root`. Nothing is created until
    /// the first registration.
    pub fn open(page_root: impl AsRef<Path>) -> Self {
        Self {
            index: page_root.as_ref().join(INDEX_DIR),
            writes: Mutex::new(()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index
    }

    /// Record that `path` was rendered from `resources`.
    ///
    /// Replaces any previous registration for the same path. Resource
    /// entries are written before the manifest, so a reader never sees a
    /// manifest whose resources cannot find it.
    pub fn register(&self, path: &PathKey, resources: &HashSet<ResourceId>) -> io::Result<()> {
        let _guard = mutex_lock(&self.writes, SOURCE, "register");

        let previous = self.read_manifest(path)?;
        for resource in resources {
            let marker = self.marker_file(resource, path);
            if let Some(dir) = marker.parent() {
                fs::create_dir_all(dir)?;
            }
            write_atomic(&marker, path.as_str().as_bytes())?;
        }

        let mut listed: Vec<ResourceId> = resources.iter().cloned().collect();
        listed.sort();
        let manifest = Manifest {
            path: path.as_str().to_string(),
            resources: listed,
        };
        let bytes = serde_json::to_vec(&manifest).map_err(io::Error::other)?;
        let file = self.manifest_file(path);
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir)?;
        }
        write_atomic(&file, &bytes)?;

        for resource in previous.difference(resources) {
            self.remove_marker(resource, path)?;
        }
        Ok(())
    }

    /// Every page recorded as rendered from `resource`.
    pub fn paths_for(&self, resource: &ResourceId) -> io::Result<HashSet<PathKey>> {
        let dir = self.resource_dir(resource);
        let mut paths = HashSet::new();
        for entry in read_dir_or_empty(&dir)? {
            let entry = entry?;
            if is_hidden(&entry.file_name()) {
                continue;
            }
            let raw = match fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            match PathKey::normalize(&raw) {
                Ok(path) => {
                    paths.insert(path);
                }
                Err(err) => warn!(
                    resource = %resource,
                    entry = %entry.path().display(),
                    error = %err,
                    "Ignoring unreadable artifact index entry"
                ),
            }
        }
        Ok(paths)
    }

    pub fn resources_for(&self, path: &PathKey) -> io::Result<HashSet<ResourceId>> {
        self.read_manifest(path)
    }

    /// Remove a page and clean up its resource mappings.
    pub fn unregister(&self, path: &PathKey) -> io::Result<()> {
        let _guard = mutex_lock(&self.writes, SOURCE, "unregister");
        self.unregister_locked(path)
    }

    /// Unregister `path` after its files were removed because `resource`
    /// changed. Drops `resource`'s entry even when another process has
    /// since rewritten the manifest without it.
    pub fn release(&self, resource: &ResourceId, path: &PathKey) -> io::Result<()> {
        let _guard = mutex_lock(&self.writes, SOURCE, "release");
        self.unregister_locked(path)?;
        self.remove_marker(resource, path)
    }

    /// Drop every page whose path starts with `prefix`.
    pub fn unregister_prefix(&self, prefix: &str) -> io::Result<Vec<PathKey>> {
        let _guard = mutex_lock(&self.writes, SOURCE, "unregister_prefix");
        let matching: Vec<PathKey> = self
            .registered_paths()?
            .into_iter()
            .filter(|path| path.as_str().starts_with(prefix))
            .collect();
        for path in &matching {
            self.unregister_locked(path)?;
        }
        Ok(matching)
    }

    pub fn path_count(&self) -> io::Result<usize> {
        Ok(self.registered_paths()?.len())
    }

    pub fn resource_count(&self) -> io::Result<usize> {
        let mut count = 0;
        for entry in read_dir_or_empty(&self.index.join(RESOURCES_DIR))? {
            let entry = entry?;
            if !is_hidden(&entry.file_name()) && read_dir_or_empty(&entry.path())?.next().is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn unregister_locked(&self, path: &PathKey) -> io::Result<()> {
        for resource in self.read_manifest(path)? {
            self.remove_marker(&resource, path)?;
        }
        remove_if_present(&self.manifest_file(path))
    }

    fn registered_paths(&self) -> io::Result<Vec<PathKey>> {
        let mut paths = Vec::new();
        for entry in read_dir_or_empty(&self.index.join(PATHS_DIR))? {
            let entry = entry?;
            let file = entry.path();
            if is_hidden(&entry.file_name())
                || file.extension().is_none_or(|ext| ext != MANIFEST_EXT)
            {
                continue;
            }
            if let Some(manifest) = read_manifest_file(&file)? {
                if let Ok(path) = PathKey::normalize(&manifest.path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    fn read_manifest(&self, path: &PathKey) -> io::Result<HashSet<ResourceId>> {
        Ok(read_manifest_file(&self.manifest_file(path))?
            .map(|manifest| manifest.resources.into_iter().collect())
            .unwrap_or_default())
    }

    fn remove_marker(&self, resource: &ResourceId, path: &PathKey) -> io::Result<()> {
        remove_if_present(&self.marker_file(resource, path))?;
        // Only succeeds once the directory is empty.
        let _ = fs::remove_dir(self.resource_dir(resource));
        Ok(())
    }

    fn manifest_file(&self, path: &PathKey) -> PathBuf {
        self.index
            .join(PATHS_DIR)
            .join(format!("{}.{MANIFEST_EXT}", digest(path.as_str())))
    }

    fn resource_dir(&self, resource: &ResourceId) -> PathBuf {
        self.index
            .join(RESOURCES_DIR)
            .join(digest(&resource.to_string()))
    }

    fn marker_file(&self, resource: &ResourceId, path: &PathKey) -> PathBuf {
        self.resource_dir(resource).join(digest(path.as_str()))
    }
}

fn digest(value: &str) -> String {
    let mut encoded = hex::encode(Sha256::digest(value.as_bytes()));
    encoded.truncate(DIGEST_LEN);
    encoded
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn read_manifest_file(file: &Path) -> io::Result<Option<Manifest>> {
    match fs::read(file) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(err) => {
                warn!(
                    manifest = %file.display(),
                    error = %err,
                    "Ignoring corrupt artifact manifest"
                );
                Ok(None)
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn read_dir_or_empty(dir: &Path) -> io::Result<Box<dyn Iterator<Item = io::Result<fs::DirEntry>>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Box::new(entries)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
        Err(err) => Err(err),
    }
}

fn remove_if_present(file: &Path) -> io::Result<()> {
    match fs::remove_file(file) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
