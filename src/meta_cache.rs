//! Coalescing cache of base-image metadata trees
//!
//! In a batch run every target usually shares a base image; the cache makes
//! sure each tar file is decoded once no matter how many sessions ask for it.

use crate::error::TakiError;
use crate::meta::DirMeta;
use crate::meta_builder::build_from_tar_file;
use crate::task::AsyncTask;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type MetaTask = AsyncTask<Arc<DirMeta>>;

/// Builds the tree for one canonical path. Runs on a blocking thread.
pub type MetaLoader = Arc<dyn Fn(&Path) -> Result<DirMeta, TakiError> + Send + Sync>;

pub struct MetaCache {
    /// In-flight and completed builds. Entries are never evicted.
    cache: Mutex<HashMap<PathBuf, MetaTask>>,
    loader: MetaLoader,
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaCache {
    /// Cache that decodes base images as tar files.
    pub fn new() -> Self {
        Self::with_loader(Arc::new(|path: &Path| -> Result<DirMeta, TakiError> {
            Ok(build_from_tar_file(path)?.finish().0)
        }))
    }

    pub fn with_loader(loader: MetaLoader) -> Self {
        MetaCache {
            cache: Mutex::new(HashMap::new()),
            loader,
        }
    }

    /// Get the task for `path`, starting a build if this is the first request.
    /// Must be called from inside a Tokio runtime.
    pub fn request(&self, path: &Path) -> MetaTask {
        let key = cache_key(path);
        let mut cache = self.cache.lock();
        if let Some(task) = cache.get(&key) {
            return task.clone();
        }
        let loader = Arc::clone(&self.loader);
        let path = key.clone();
        let task = MetaTask::spawn_blocking(move || loader(&path).map(Arc::new));
        cache.insert(key, task.clone());
        task
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

/// Canonical form of a cache key; falls back to a lexical clean when the file
/// does not exist (the build will then report the error).
fn cache_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.components().collect())
}
