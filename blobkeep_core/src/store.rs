use std::{
    any::Any,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    OptionalOrUnknown,
    blob::{BlobContext, BlobUpdateContext, BlobWriteContext},
    error::{BlobError, BlobResult},
    gc::BinaryGarbageCollector,
    key::KeyStrategy,
    paths::{TEMP_PREFIX, TEMP_SUFFIX},
};

/// Byte stream of a stored blob.
pub type BlobReader = Box<dyn Read + Send>;

/// Storage of blobs by key.
///
/// Stores compose by decoration: a decorator holds an `Arc<dyn BlobStore>`
/// and forwards what it does not change. All methods may block on I/O.
pub trait BlobStore: std::fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// True if every write produces a fresh `<base>@<version>` key.
    fn has_versioning(&self) -> bool;

    fn key_strategy(&self) -> Arc<dyn KeyStrategy>;

    /// Writes the blob and returns its key. For versioned stores the returned
    /// key is the one to use for reads, not the base key of the context.
    fn write_blob(&self, ctx: &mut BlobWriteContext) -> BlobResult<String>;

    fn write_blob_context(&self, blob_context: BlobContext) -> BlobResult<String> {
        let mut ctx = self.key_strategy().blob_write_context(blob_context)?;
        self.write_blob(&mut ctx)
    }

    /// True if [`BlobStore::copy_blob`] from `source` avoids streaming the
    /// bytes through this process.
    fn copy_blob_is_optimized(&self, _source: &dyn BlobStore) -> bool {
        false
    }

    /// Copies (or moves, if `atomic_move`) `source_key` of `source` to `key`
    /// of this store. Returns `false` if the source blob does not exist.
    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool>;

    /// Local file holding the blob, if the store has one.
    fn get_file(&self, key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>>;

    fn get_stream(&self, key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>>;

    /// Writes the blob to `dest`. Returns `false` if it does not exist.
    fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        match self.get_stream(key)? {
            OptionalOrUnknown::Present(mut reader) => {
                let mut out = File::create(dest)?;
                io::copy(&mut reader, &mut out)?;
                out.sync_all()?;
                Ok(true)
            }
            OptionalOrUnknown::Missing => Ok(false),
            OptionalOrUnknown::Unknown => Err(BlobError::unsupported(format!(
                "{} cannot stream blob {key}",
                self.name()
            ))),
        }
    }

    fn write_blob_properties(&self, ctx: &BlobUpdateContext) -> BlobResult<()>;

    /// Best-effort removal; failures are logged, never returned.
    fn delete_blob(&self, key: &str);

    fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector>;

    /// Lowest-level store below any decorators.
    fn unwrapped(&self) -> &dyn BlobStore;

    fn as_any(&self) -> &dyn Any;
}

/// Copy that works between any two stores: uses the local file of the
/// source if there is one, else reads it into a temporary file, then writes
/// that under `key` in `dest`.
pub fn copy_blob_generic(
    dest: &dyn BlobStore,
    key: &str,
    source: &dyn BlobStore,
    source_key: &str,
    atomic_move: bool,
) -> BlobResult<bool> {
    let tmp;
    let file = match source.get_file(source_key)? {
        OptionalOrUnknown::Present(path) => path,
        OptionalOrUnknown::Missing => return Ok(false),
        OptionalOrUnknown::Unknown => {
            tmp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(TEMP_SUFFIX)
                .tempfile()?
                .into_temp_path();
            if !source.read_blob(source_key, &tmp)? {
                return Ok(false);
            }
            tmp.to_path_buf()
        }
    };
    let mut ctx = BlobWriteContext::for_file(file, key);
    let stored = dest.write_blob(&mut ctx)?;
    if stored != key {
        // versioning stores choose their own keys
        dest.delete_blob(&stored);
        return Err(BlobError::unsupported(format!(
            "{} stored {stored} instead of {key}, cannot copy to a fixed key",
            dest.name()
        )));
    }
    if atomic_move {
        source.delete_blob(source_key);
    }
    tracing::debug!(
        "copied {}:{source_key} to {}:{key} (move: {atomic_move})",
        source.name(),
        dest.name()
    );
    Ok(true)
}

/// Reads a whole blob into memory, `None` if it is missing.
pub fn read_blob_bytes(store: &dyn BlobStore, key: &str) -> BlobResult<Option<Vec<u8>>> {
    match store.get_stream(key)? {
        OptionalOrUnknown::Present(mut reader) => {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(Some(buf))
        }
        OptionalOrUnknown::Missing => Ok(None),
        OptionalOrUnknown::Unknown => {
            let tmp = tempfile::NamedTempFile::new()?;
            if store.read_blob(key, tmp.path())? {
                Ok(Some(std::fs::read(tmp.path())?))
            } else {
                Ok(None)
            }
        }
    }
}
