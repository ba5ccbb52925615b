use std::{any::Any, io, path::PathBuf, sync::Arc};

use crate::{
    OptionalOrUnknown,
    blob::{BlobUpdateContext, BlobWriteContext},
    error::BlobResult,
    gc::{BinaryGarbageCollector, NoopCollector},
    key::KeyStrategy,
    store::{BlobReader, BlobStore},
};

/// Store that accepts and discards everything, for the permanent half of a
/// cache-only setup.
#[derive(Debug, Clone)]
pub struct EmptyBlobStore {
    name: String,
    key_strategy: Arc<dyn KeyStrategy>,
}

impl EmptyBlobStore {
    pub fn new(name: impl Into<String>, key_strategy: Arc<dyn KeyStrategy>) -> Self {
        Self {
            name: name.into(),
            key_strategy,
        }
    }
}

impl BlobStore for EmptyBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_versioning(&self) -> bool {
        false
    }

    fn key_strategy(&self) -> Arc<dyn KeyStrategy> {
        self.key_strategy.clone()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext) -> BlobResult<String> {
        if ctx.key_is_known() {
            return ctx.key();
        }
        // digest keys need the bytes to go through once
        ctx.transfer(&mut io::sink())?;
        ctx.key()
    }

    fn copy_blob(
        &self,
        _key: &str,
        _source: &dyn BlobStore,
        _source_key: &str,
        _atomic_move: bool,
    ) -> BlobResult<bool> {
        Ok(true)
    }

    fn get_file(&self, _key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>> {
        Ok(OptionalOrUnknown::Missing)
    }

    fn get_stream(&self, _key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>> {
        Ok(OptionalOrUnknown::Missing)
    }

    fn read_blob(&self, _key: &str, _dest: &std::path::Path) -> BlobResult<bool> {
        Ok(false)
    }

    fn write_blob_properties(&self, _ctx: &BlobUpdateContext) -> BlobResult<()> {
        Ok(())
    }

    fn delete_blob(&self, _key: &str) {}

    fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector> {
        Arc::new(NoopCollector::new(format!("empty:{}", self.name)))
    }

    fn unwrapped(&self) -> &dyn BlobStore {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
