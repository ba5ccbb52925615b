//! Bounded local disk cache in front of a slow or remote blob store.
//!
//! Every cache access updates the file mtime, which makes the cache an LRU:
//! eviction walks files from most to least recently used and deletes the
//! ones past the configured count or size limits.

use blobkeep_core::{
    BlobResult, BlobUpdateContext, BlobWriteContext, KeyStrategy, OptionalOrUnknown,
    PathStrategy, PathStrategyShortened,
    gc::BinaryGarbageCollector,
    paths,
    store::{BlobReader, BlobStore},
};
use blobkeep_store_local::LocalBlobStore;
use std::{
    any::Any,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime},
};
use walkdir::WalkDir;

pub mod gc;
pub mod locks;

pub use gc::FanOutCollector;
pub use locks::{FileLockGuard, FileLocks};

pub const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_COUNT: u64 = 10_000;
pub const DEFAULT_MIN_AGE: Duration = Duration::from_secs(3600);
pub const DEFAULT_CLEAR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Size above which old files are evicted.
    pub max_size: u64,
    /// Count above which old files are evicted.
    pub max_count: u64,
    /// Files accessed more recently than this are never evicted.
    pub min_age: Duration,
    /// Minimum time between two automatic evictions.
    pub clear_interval: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_size: DEFAULT_MAX_SIZE,
            max_count: DEFAULT_MAX_COUNT,
            min_age: DEFAULT_MIN_AGE,
            clear_interval: DEFAULT_CLEAR_INTERVAL,
        }
    }
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheClearReport {
    pub kept_count: u64,
    pub kept_size: u64,
    pub deleted_count: u64,
    pub deleted_size: u64,
}

#[derive(Debug)]
pub struct CachingBlobStore {
    name: String,
    store: Arc<dyn BlobStore>,
    cache: LocalBlobStore,
    cache_paths: Arc<dyn PathStrategy>,
    config: CacheConfig,
    locks: Arc<FileLocks>,
    last_clear: Mutex<Option<Instant>>,
    gc: Arc<FanOutCollector>,
}

impl CachingBlobStore {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn BlobStore>,
        config: CacheConfig,
        locks: Arc<FileLocks>,
    ) -> BlobResult<Self> {
        let name = name.into();
        let cache_paths: Arc<dyn PathStrategy> =
            Arc::new(PathStrategyShortened::new(config.dir.clone()));
        cache_paths.ensure_dirs()?;
        let cache = LocalBlobStore::new(
            format!("{name}-cache"),
            store.key_strategy(),
            cache_paths.clone(),
        );
        let gc = Arc::new(FanOutCollector::new([
            cache.garbage_collector(),
            store.garbage_collector(),
        ]));
        Ok(Self {
            name,
            store,
            cache,
            cache_paths,
            config,
            locks,
            last_clear: Mutex::new(None),
            gc,
        })
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Collectors of the cache directory and of the wrapped store.
    pub fn garbage_collectors(&self) -> &[Arc<dyn BinaryGarbageCollector>] {
        self.gc.collectors()
    }

    /// Path of the cached file for `key`, present or not.
    pub fn cache_path(&self, key: &str) -> BlobResult<PathBuf> {
        self.cache_paths.path_for_key(key)
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.cache_path(key).is_ok_and(|p| p.is_file())
    }

    /// Touches the cached file if present. Returns whether it is present.
    fn record_access(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        if let Some(_guard) = self.locks.lock(path) {
            let touched = File::options()
                .write(true)
                .open(path)
                .and_then(|f| f.set_modified(SystemTime::now()));
            match touched {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
                Err(e) => tracing::warn!("cache: failed to touch {}: {e}", path.display()),
            }
        }
        path.is_file()
    }

    /// Returns the cached file for `key`, fetching it from the wrapped store
    /// if needed. `None` if the wrapped store does not have it.
    fn cached_file(&self, key: &str) -> BlobResult<Option<PathBuf>> {
        let path = self.cache_path(key)?;
        if self.record_access(&path) {
            return Ok(Some(path));
        }
        if !self.cache.copy_blob(key, self.store.as_ref(), key, false)? {
            return Ok(None);
        }
        tracing::debug!("{}: fetched {key} into cache", self.name);
        self.clear_old_blobs();
        Ok(Some(path))
    }

    fn evict(&self, path: &Path) {
        if let Some(_guard) = self.locks.lock(path) {
            remove_file_quietly(path);
        }
    }

    /// Evicts old files, at most once per configured interval. Skipped if
    /// another thread is already evicting.
    pub fn clear_old_blobs(&self) {
        let Ok(mut last) = self.last_clear.try_lock() else {
            return;
        };
        if let Some(t) = *last
            && t.elapsed() < self.config.clear_interval
        {
            return;
        }
        *last = Some(Instant::now());
        if let Err(e) = self.clear_old_blobs_now() {
            tracing::warn!("{}: cache eviction failed: {e}", self.name);
        }
    }

    /// Evicts least recently used files until the cache fits its limits.
    /// Files younger than the minimum age are kept regardless.
    pub fn clear_old_blobs_now(&self) -> BlobResult<CacheClearReport> {
        let threshold = SystemTime::now()
            .checked_sub(self.config.min_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.config.dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("cache: cannot walk {}: {e}", self.config.dir.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() || self.cache_paths.is_temp_file(entry.path()) {
                continue;
            }
            // vanished files are simply skipped
            if let Ok(meta) = entry.metadata() {
                files.push((entry.into_path(), meta.modified()?, meta.len()));
            }
        }
        // most recent first
        files.sort_by(|a, b| b.1.cmp(&a.1));

        let mut report = CacheClearReport::default();
        let (mut count, mut size) = (0u64, 0u64);
        for (path, modified, len) in files {
            count += 1;
            size += len;
            if (count > self.config.max_count || size > self.config.max_size)
                && modified <= threshold
                && self.evict_if_old(&path, threshold)
            {
                count -= 1;
                size -= len;
                report.deleted_count += 1;
                report.deleted_size += len;
                continue;
            }
            report.kept_count += 1;
            report.kept_size += len;
        }
        tracing::debug!(
            "{}: cache clear kept {} ({} bytes), deleted {} ({} bytes)",
            self.name,
            report.kept_count,
            report.kept_size,
            report.deleted_count,
            report.deleted_size
        );
        Ok(report)
    }

    /// Copy from a store without cache. The bytes go to the cache as well as
    /// the wrapped store, which may not keep them at all.
    fn copy_blob_uncached(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool> {
        if !self.cache.copy_blob(key, source, source_key, false)? {
            return Ok(false);
        }
        if !self.store.copy_blob(key, source, source_key, atomic_move)? {
            self.evict(&self.cache_path(key)?);
            return Ok(false);
        }
        // the wrapped store may have accepted the move without consuming it
        let same_blob = std::ptr::addr_eq(source, self.store.as_ref()) && key == source_key;
        if atomic_move && !same_blob {
            source.delete_blob(source_key);
        }
        tracing::debug!("{}: cached copied {key}", self.name);
        self.clear_old_blobs();
        Ok(true)
    }

    fn evict_if_old(&self, path: &Path, threshold: SystemTime) -> bool {
        let Some(_guard) = self.locks.lock(path) else {
            return false;
        };
        // may have been accessed since it was listed
        let still_old = fs::metadata(path)
            .and_then(|m| m.modified())
            .is_ok_and(|m| m <= threshold);
        if !still_old {
            return false;
        }
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("cache: failed to evict {}: {e}", path.display());
                false
            }
        }
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!("cache: failed to remove {}: {e}", path.display());
    }
}

impl BlobStore for CachingBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_versioning(&self) -> bool {
        self.store.has_versioning()
    }

    fn key_strategy(&self) -> Arc<dyn KeyStrategy> {
        self.store.key_strategy()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext) -> BlobResult<String> {
        let tmp = self.cache_paths.create_temp_file()?;
        if let Err(e) = ctx.transfer_to(&tmp) {
            remove_file_quietly(&tmp);
            return Err(e);
        }
        let key = match ctx.key() {
            Ok(key) => key,
            Err(e) => {
                remove_file_quietly(&tmp);
                return Err(e);
            }
        };
        if ctx.use_deduplication() && !self.store.has_versioning() {
            let path = self.cache_path(&key)?;
            if self.record_access(&path) {
                tracing::debug!("{}: blob {key} already cached", self.name);
                remove_file_quietly(&tmp);
                return Ok(key);
            }
        }
        // the wrapped store reads from the temp file
        let key = match self.store.write_blob(ctx) {
            Ok(key) => key,
            Err(e) => {
                remove_file_quietly(&tmp);
                return Err(e);
            }
        };
        let dest = self.cache_path(&key)?;
        {
            let _guard = self.locks.lock(&dest);
            if let Err(e) = paths::atomic_move(&tmp, &dest) {
                tracing::warn!("{}: failed to cache {key}: {e}", self.name);
                remove_file_quietly(&tmp);
            }
        }
        self.clear_old_blobs();
        Ok(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        match source.as_any().downcast_ref::<CachingBlobStore>() {
            Some(caching) => self.store.copy_blob_is_optimized(caching.store.as_ref()),
            None => self.store.copy_blob_is_optimized(source),
        }
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool> {
        let dest = self.cache_path(key)?;
        // the cached copy of `key`, if any, may be about to change
        self.evict(&dest);
        let Some(caching) = source.as_any().downcast_ref::<CachingBlobStore>() else {
            return self.copy_blob_uncached(key, source, source_key, atomic_move);
        };
        let found = self
            .store
            .copy_blob(key, caching.store.as_ref(), source_key, atomic_move)?;
        if found {
            let source_path = caching.cache_path(source_key)?;
            if source_path.is_file() {
                let tmp = self.cache_paths.create_temp_file()?;
                let copied = if atomic_move {
                    let _guard = caching.locks.lock(&source_path);
                    fs::rename(&source_path, &tmp)
                        .or_else(|_| fs::copy(&source_path, &tmp).map(|_| ()))
                } else {
                    fs::copy(&source_path, &tmp).map(|_| ())
                };
                match copied.and_then(|_| paths::atomic_move(&tmp, &dest)) {
                    Ok(()) => {}
                    Err(e) => {
                        tracing::debug!("{}: not caching copied {key}: {e}", self.name);
                        remove_file_quietly(&tmp);
                    }
                }
            }
        }
        Ok(found)
    }

    fn get_file(&self, key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>> {
        Ok(OptionalOrUnknown::of(self.cached_file(key)?))
    }

    fn get_stream(&self, key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>> {
        let Some(path) = self.cached_file(key)? else {
            return Ok(OptionalOrUnknown::Missing);
        };
        match File::open(&path) {
            Ok(file) => Ok(OptionalOrUnknown::Present(Box::new(BufReader::new(file)))),
            // evicted in the meantime
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.store.get_stream(key),
            Err(e) => Err(e.into()),
        }
    }

    fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        let Some(path) = self.cached_file(key)? else {
            return Ok(false);
        };
        match fs::copy(&path, dest) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.store.read_blob(key, dest),
            Err(e) => Err(e.into()),
        }
    }

    fn write_blob_properties(&self, ctx: &BlobUpdateContext) -> BlobResult<()> {
        self.store.write_blob_properties(ctx)
    }

    fn delete_blob(&self, key: &str) {
        match self.cache_path(key) {
            Ok(path) => self.evict(&path),
            Err(e) => tracing::warn!("{}: cannot evict {key}: {e}", self.name),
        }
        self.store.delete_blob(key);
    }

    fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector> {
        self.gc.clone()
    }

    fn unwrapped(&self) -> &dyn BlobStore {
        self.store.unwrapped()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobkeep_core::{
        Blob, BlobContext, DigestAlgorithm, EmptyBlobStore, KeyStrategyDigest, KeyStrategyDocId,
        store::read_blob_bytes,
        testutil::{BlobStoreTests, random_bytes},
    };
    use blobkeep_store_memory::InMemoryBlobStore;

    fn caching(
        dir: &Path,
        store: Arc<dyn BlobStore>,
        tweak: impl FnOnce(&mut CacheConfig),
    ) -> CachingBlobStore {
        let mut config = CacheConfig::new(dir);
        tweak(&mut config);
        CachingBlobStore::new("cache", store, config, Arc::new(FileLocks::new())).unwrap()
    }

    fn memory() -> Arc<InMemoryBlobStore> {
        Arc::new(InMemoryBlobStore::new(
            "remote",
            Arc::new(KeyStrategyDigest::new(DigestAlgorithm::Sha256)),
        ))
    }

    fn write(store: &dyn BlobStore, data: &'static [u8]) -> String {
        store
            .write_blob_context(BlobContext::new(Blob::from_bytes(data)))
            .unwrap()
    }

    #[test]
    fn test_caching_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = caching(dir.path(), memory(), |_| {});
        BlobStoreTests::new(&store).run_all().unwrap();
    }

    #[test]
    fn test_caching_store_doc_id_no_stream() {
        let dir = tempfile::tempdir().unwrap();
        let remote = InMemoryBlobStore::new("remote", Arc::new(KeyStrategyDocId)).with_no_stream(true);
        let store = caching(dir.path(), Arc::new(remote), |_| {});
        BlobStoreTests::new(&store).run_all().unwrap();
    }

    #[test]
    fn write_goes_to_cache_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let remote = memory();
        let store = caching(dir.path(), remote.clone(), |_| {});
        let key = write(&store, b"hello");
        assert!(store.is_cached(&key));
        assert!(remote.contains(&key));
        // nothing but the cached file is left behind
        let files: Vec<_> = WalkDir::new(dir.path())
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn eviction_keeps_recent_and_honors_limits() {
        let dir = tempfile::tempdir().unwrap();
        let remote = memory();
        let store = caching(dir.path(), remote.clone(), |c| {
            c.max_count = 2;
            c.min_age = Duration::ZERO;
            c.clear_interval = Duration::from_secs(3600);
        });
        let keys: Vec<String> = (0..4)
            .map(|_| {
                store
                    .write_blob_context(BlobContext::new(Blob::from_bytes(random_bytes(10))))
                    .unwrap()
            })
            .collect();
        // order accesses explicitly, oldest first
        let now = SystemTime::now();
        for (i, key) in keys.iter().enumerate() {
            let path = store.cache_path(key).unwrap();
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(now - Duration::from_secs(100 - i as u64))
                .unwrap();
        }
        let report = store.clear_old_blobs_now().unwrap();
        assert_eq!(report.kept_count, 2);
        assert_eq!(report.deleted_count, 2);
        assert_eq!(report.deleted_size, 20);
        assert!(!store.is_cached(&keys[0]));
        assert!(!store.is_cached(&keys[1]));
        assert!(store.is_cached(&keys[2]));
        assert!(store.is_cached(&keys[3]));
        assert_eq!(remote.len(), 4);
    }

    #[test]
    fn automatic_eviction_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let store = caching(dir.path(), memory(), |c| {
            c.max_count = 0;
            c.min_age = Duration::ZERO;
            c.clear_interval = Duration::from_secs(3600);
        });
        let first = write(&store, b"first");
        // the first write triggered an eviction of everything
        assert!(!store.is_cached(&first));
        let second = write(&store, b"second");
        assert!(store.is_cached(&second));
    }

    #[test]
    fn locked_files_are_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(FileLocks::new());
        let mut config = CacheConfig::new(dir.path());
        config.max_count = 0;
        config.min_age = Duration::ZERO;
        let store = CachingBlobStore::new("cache", memory(), config, locks.clone()).unwrap();
        let key = write(&store, b"locked");
        // the write evicted it already; fetch it back
        assert!(store.get_file(&key).unwrap().is_present());
        let path = store.cache_path(&key).unwrap();
        let guard = locks.try_lock(&path).unwrap();
        let report = store.clear_old_blobs_now().unwrap();
        assert_eq!(report.deleted_count, 0);
        assert!(path.is_file());
        drop(guard);
        let report = store.clear_old_blobs_now().unwrap();
        assert_eq!(report.deleted_count, 1);
        assert!(!path.exists());
    }

    #[test]
    fn delete_removes_from_cache_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let remote = memory();
        let store = caching(dir.path(), remote.clone(), |_| {});
        let key = write(&store, b"bye");
        store.delete_blob(&key);
        assert!(!store.is_cached(&key));
        assert!(!remote.contains(&key));
        assert_eq!(read_blob_bytes(&store, &key).unwrap(), None);
    }

    #[test]
    fn copy_between_caches() {
        let dir = tempfile::tempdir().unwrap();
        let a = caching(&dir.path().join("a"), memory(), |_| {});
        let b_remote = memory();
        let b = caching(&dir.path().join("b"), b_remote.clone(), |_| {});
        assert!(b.copy_blob_is_optimized(&a));
        let key = write(&a, b"shared");
        assert!(b.copy_blob(&key, &a, &key, false).unwrap());
        assert!(b.is_cached(&key));
        assert!(b_remote.contains(&key));
        assert!(a.is_cached(&key));
        assert_eq!(read_blob_bytes(&b, &key).unwrap().unwrap(), b"shared");
    }

    #[test]
    fn move_into_cache_over_empty_store_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let strategy: Arc<dyn KeyStrategy> =
            Arc::new(KeyStrategyDigest::new(DigestAlgorithm::Md5));
        let empty = Arc::new(EmptyBlobStore::new("empty", strategy.clone()));
        let store = caching(dir.path(), empty, |_| {});
        let source = InMemoryBlobStore::new("staging", strategy);
        let staged = write(&source, b"hello");

        assert!(store.copy_blob("5d41402abc4b2a76b9719d911017c592", &source, &staged, true).unwrap());
        assert!(store.is_cached("5d41402abc4b2a76b9719d911017c592"));
        assert!(source.is_empty());
        assert_eq!(
            read_blob_bytes(&store, "5d41402abc4b2a76b9719d911017c592").unwrap().unwrap(),
            b"hello"
        );

        // nothing to copy, nothing cached
        assert!(!store.copy_blob("missing", &source, "missing", false).unwrap());
        assert!(!store.is_cached("missing"));
    }

    #[test]
    fn copy_from_uncached_store_fills_cache() {
        let dir = tempfile::tempdir().unwrap();
        let remote = memory();
        let store = caching(dir.path(), remote.clone(), |_| {});
        let source = memory();
        let key = write(source.as_ref(), b"shared");

        assert!(store.copy_blob(&key, source.as_ref(), &key, false).unwrap());
        assert!(store.is_cached(&key));
        assert!(remote.contains(&key));
        assert!(source.contains(&key));
    }

    #[test]
    fn gc_fans_out_to_cache_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let remote = memory();
        let store = caching(dir.path(), remote.clone(), |_| {});
        let keep = write(&store, b"keep");
        let drop_key = write(&store, b"drop");
        // age the cached files past the collector's start
        for key in [&keep, &drop_key] {
            File::options()
                .write(true)
                .open(store.cache_path(key).unwrap())
                .unwrap()
                .set_modified(SystemTime::now() - Duration::from_secs(3600))
                .unwrap();
        }
        let gc = store.garbage_collector();
        gc.start().unwrap();
        gc.mark(&keep).unwrap();
        let status = gc.stop(true).unwrap();
        assert_eq!(status.num_binaries_gc, 2);
        assert!(remote.contains(&keep));
        assert!(!remote.contains(&drop_key));
        assert!(store.is_cached(&keep));
        assert!(!store.is_cached(&drop_key));
    }
}
