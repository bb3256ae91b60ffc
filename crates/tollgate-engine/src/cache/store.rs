//! File-backed, content-addressed response cache.

use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

use super::types::{CacheEntry, CacheStats, Fingerprint};
use crate::descriptor::Request;

/// Errors that can occur while reading or writing cache files.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem access failed.
    #[error("Cache IO error at {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// A cache entry could not be serialized.
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

/// Response cache rooted at one directory, one `<fingerprint>.json` file per entry.
///
/// Cheap to clone; clones share statistics.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    counters: Arc<Counters>,
}

impl ResponseCache {
    /// Creates a cache over `dir`. The directory is created on first store.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), counters: Arc::new(Counters::default()) }
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding the entry for `fingerprint`.
    #[must_use]
    pub fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.as_hex()))
    }

    /// Looks up the stored response for a request.
    ///
    /// A file whose stored request differs from `request`'s payload, or which cannot be
    /// decoded, counts as a miss.
    ///
    /// # Errors
    /// Returns `CacheError::Io` if an existing file cannot be read.
    pub async fn lookup(&self, request: &Request) -> Result<Option<Value>, CacheError> {
        let path = self.path_for(request.fingerprint());
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache entry, treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if entry.request != *request.payload() {
            warn!(fingerprint = %request.fingerprint(), "Cached request differs from payload, treating as miss");
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        debug!(fingerprint = %request.fingerprint(), "Cache hit");
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.response))
    }

    /// Stores a successful response.
    ///
    /// Writes to a temporary file and renames it into place, so readers never see a partial
    /// entry and concurrent writers of the same fingerprint cannot interleave.
    ///
    /// # Errors
    /// Returns `CacheError` if the directory or file cannot be written.
    pub async fn store(&self, request: &Request, response: &Value) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| CacheError::io(&self.dir, e))?;

        let entry = CacheEntry { request: request.payload().clone(), response: response.clone() };
        let bytes = serde_json::to_vec_pretty(&entry)?;

        let path = self.path_for(request.fingerprint());
        let tmp = self.dir.join(format!(
            "{}.json.tmp-{}",
            request.fingerprint().as_hex(),
            uuid::Uuid::new_v4()
        ));

        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            return Err(CacheError::io(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CacheError::io(&path, e));
        }

        debug!(fingerprint = %request.fingerprint(), path = %path.display(), "Cached response");
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tollgate_abstraction::EndpointFamily;

    fn request(value: Value) -> Request {
        Request::new(EndpointFamily::OpenAI, value.as_object().cloned().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path().join("openai_cache"));
        let req = request(json!({"model": "m", "messages": [], "temperature": 0}));
        let body = json!({"choices": [{"message": {"content": "ok"}}]});

        assert_eq!(cache.lookup(&req).await.unwrap(), None);
        cache.store(&req, &body).await.unwrap();
        assert_eq!(cache.lookup(&req).await.unwrap(), Some(body));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.stores), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_file_layout() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path());
        let req = request(json!({"model": "m", "messages": []}));
        cache.store(&req, &json!({"choices": []})).await.unwrap();

        let path = temp.path().join(format!("{}.json", req.fingerprint().as_hex()));
        let entry: CacheEntry = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(entry.request, *req.payload());
        assert_eq!(entry.response, json!({"choices": []}));

        let files: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(files.len(), 1, "temporary file must be renamed away");
    }

    #[tokio::test]
    async fn test_payload_mismatch_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path());
        let req = request(json!({"model": "m", "messages": []}));

        let forged = CacheEntry {
            request: json!({"model": "other", "messages": []}).as_object().cloned().unwrap(),
            response: json!({"choices": []}),
        };
        std::fs::write(cache.path_for(req.fingerprint()), serde_json::to_vec(&forged).unwrap())
            .unwrap();

        assert_eq!(cache.lookup(&req).await.unwrap(), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::new(temp.path());
        let req = request(json!({"model": "m", "messages": []}));
        std::fs::write(cache.path_for(req.fingerprint()), b"{not json").unwrap();

        assert_eq!(cache.lookup(&req).await.unwrap(), None);
    }
}
