use blobkeep_core::{
    BlobResult, BlobUpdateContext, BlobWriteContext, KeyStrategy, OptionalOrUnknown,
    blob::{VER_SEP, strip_blob_key_version},
    gc::{BinaryGarbageCollector, BinaryManagerStatus, GcRun, MarkSweepCollector, SweepBackend},
    store::{BlobReader, BlobStore, read_blob_bytes},
};
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    any::Any,
    fs,
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use tempfile::TempDir;

/// Out-of-band properties recorded by [`BlobStore::write_blob_properties`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub retain_until: Option<SystemTime>,
    pub legal_hold: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    blobs: DashMap<String, Bytes>,
    properties: DashMap<String, BlobProperties>,
}

/// Volatile blob store, mostly for tests.
///
/// Can emulate a versioning store, a store without streams and a store with
/// local files, so that fallbacks of the layers above can be exercised.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    name: String,
    key_strategy: Arc<dyn KeyStrategy>,
    state: Arc<MemoryState>,
    gc: Arc<MarkSweepCollector<MemorySweep>>,
    emulate_versioning: bool,
    emulate_no_stream: bool,
    local_files: Option<TempDir>,
}

impl InMemoryBlobStore {
    pub fn new(name: impl Into<String>, key_strategy: Arc<dyn KeyStrategy>) -> Self {
        let state = Arc::new(MemoryState::default());
        let gc = Arc::new(MarkSweepCollector::new(MemorySweep {
            state: state.clone(),
            key_strategy: key_strategy.clone(),
        }));
        Self {
            name: name.into(),
            key_strategy,
            state,
            gc,
            emulate_versioning: false,
            emulate_no_stream: false,
            local_files: None,
        }
    }

    /// Appends a random version to every written key.
    pub fn with_versioning(mut self, versioning: bool) -> Self {
        self.emulate_versioning = versioning;
        self
    }

    /// Answers `Unknown` to every stream request.
    pub fn with_no_stream(mut self, no_stream: bool) -> Self {
        self.emulate_no_stream = no_stream;
        self
    }

    /// Materializes blobs as temporary files on `get_file`.
    pub fn with_local_files(mut self, local_files: bool) -> BlobResult<Self> {
        self.local_files = if local_files {
            Some(tempfile::tempdir()?)
        } else {
            None
        };
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.state.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.blobs.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.blobs.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.blobs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn properties(&self, key: &str) -> Option<BlobProperties> {
        self.state.properties.get(key).map(|p| p.clone())
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        self.state.blobs.get(key).map(|b| b.clone())
    }

    fn fetch(&self, source: &dyn BlobStore, source_key: &str) -> BlobResult<Option<Bytes>> {
        if let Some(mem) = source.as_any().downcast_ref::<InMemoryBlobStore>() {
            return Ok(mem.get(source_key));
        }
        Ok(read_blob_bytes(source, source_key)?.map(Bytes::from))
    }
}

impl BlobStore for InMemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_versioning(&self) -> bool {
        self.emulate_versioning
    }

    fn key_strategy(&self) -> Arc<dyn KeyStrategy> {
        self.key_strategy.clone()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext) -> BlobResult<String> {
        if !self.emulate_versioning && ctx.use_deduplication() && ctx.key_is_known() {
            let key = ctx.key()?;
            if self.contains(&key) {
                return Ok(key);
            }
        }
        let mut buf = Vec::new();
        ctx.transfer(&mut buf)?;
        let mut key = ctx.key()?;
        if self.emulate_versioning {
            key = format!("{key}{VER_SEP}{}", uuid::Uuid::new_v4().simple());
        }
        self.state.blobs.insert(key.clone(), Bytes::from(buf));
        tracing::debug!("{}: wrote blob {key}", self.name);
        Ok(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        source.as_any().is::<InMemoryBlobStore>()
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool> {
        let Some(bytes) = self.fetch(source, source_key)? else {
            return Ok(false);
        };
        self.state.blobs.insert(key.to_owned(), bytes);
        if atomic_move && !(std::ptr::addr_eq(source, self) && key == source_key) {
            source.delete_blob(source_key);
        }
        Ok(true)
    }

    fn get_file(&self, key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>> {
        let Some(dir) = &self.local_files else {
            return Ok(OptionalOrUnknown::Unknown);
        };
        let Some(bytes) = self.get(key) else {
            return Ok(OptionalOrUnknown::Missing);
        };
        let path = dir
            .path()
            .join(blobkeep_core::DigestAlgorithm::Sha256.hex_digest(key));
        fs::write(&path, &bytes)?;
        Ok(OptionalOrUnknown::Present(path))
    }

    fn get_stream(&self, key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>> {
        if self.emulate_no_stream {
            return Ok(OptionalOrUnknown::Unknown);
        }
        Ok(OptionalOrUnknown::of(
            self.get(key)
                .map(|bytes| Box::new(Cursor::new(bytes)) as BlobReader),
        ))
    }

    fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        match self.get(key) {
            Some(bytes) => {
                fs::write(dest, &bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_blob_properties(&self, ctx: &BlobUpdateContext) -> BlobResult<()> {
        if !self.contains(&ctx.key) {
            tracing::debug!("{}: no blob {} to update", self.name, ctx.key);
            return Ok(());
        }
        let mut props = self.state.properties.entry(ctx.key.clone()).or_default();
        if let Some(retain_until) = ctx.update_retain_until {
            props.retain_until = retain_until;
        }
        if let Some(hold) = ctx.update_legal_hold {
            props.legal_hold = hold;
        }
        Ok(())
    }

    fn delete_blob(&self, key: &str) {
        self.state.blobs.remove(key);
        self.state.properties.remove(key);
    }

    fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector> {
        self.gc.clone()
    }

    fn unwrapped(&self) -> &dyn BlobStore {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Every stored key not marked is garbage. With a de-duplicating key
/// strategy, keys that are not digests are left alone.
#[derive(Debug)]
pub struct MemorySweep {
    state: Arc<MemoryState>,
    key_strategy: Arc<dyn KeyStrategy>,
}

impl SweepBackend for MemorySweep {
    fn id(&self) -> String {
        format!("memory:{:p}", Arc::as_ptr(&self.state))
    }

    fn sweep(&self, run: &GcRun, status: &mut BinaryManagerStatus, delete: bool) -> BlobResult<()> {
        let dedup = self.key_strategy.use_deduplication();
        let mut garbage = Vec::new();
        for entry in self.state.blobs.iter() {
            let key = entry.key();
            if dedup
                && self
                    .key_strategy
                    .digest_from_key(strip_blob_key_version(key))
                    .is_none()
            {
                continue;
            }
            let size = entry.value().len() as u64;
            if run.marked.contains(key) {
                status.keep(size);
            } else {
                status.collect(size);
                garbage.push(key.clone());
            }
        }
        if delete {
            for key in garbage {
                self.state.blobs.remove(&key);
                self.state.properties.remove(&key);
            }
        }
        Ok(())
    }
}
