use std::{
    io::{self, Read, Seek},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use blobkeep_core::{
    Blob, BlobContent, BlobContext, BlobError, BlobInfo, BlobResult, BlobStatus,
    BlobUpdateContext, DocRef, KeyStrategy, ManagedBlob, OptionalOrUnknown,
    blob::PROVIDER_SEP,
    gc::BinaryGarbageCollector,
    store::{BlobReader, BlobStore, read_blob_bytes},
};
use blobkeep_store_caching::{CacheClearReport, CachingBlobStore, FileLocks};
use blobkeep_store_transactional::{BlobTransaction, TransactionalBlobStore};
use bytes::Bytes;

use crate::config::BlobProviderConfig;

/// Xpath of the main blob of a document.
pub const MAIN_BLOB_XPATH: &str = "content";

/// The stores built by a factory for one provider.
#[derive(Debug)]
pub struct StoreParts {
    pub store: Arc<dyn BlobStore>,
    /// Staging store of transactional providers.
    pub transient: Arc<dyn BlobStore>,
}

/// A named store stack, and the only way the rest of the system reads or
/// writes blob bytes.
///
/// Keys handed out by a provider carry its id as prefix, so that the
/// provider can be found again from the key alone.
#[derive(Debug)]
pub struct BlobProvider {
    id: String,
    config: BlobProviderConfig,
    store: Arc<dyn BlobStore>,
    cache: Option<Arc<CachingBlobStore>>,
    transactional: Option<TransactionalBlobStore>,
    closed: AtomicBool,
}

impl BlobProvider {
    /// Stacks the cache and the transactional layer, as configured, on top
    /// of the factory-built stores.
    pub fn new(
        id: impl Into<String>,
        config: BlobProviderConfig,
        parts: StoreParts,
        locks: Arc<FileLocks>,
    ) -> BlobResult<Self> {
        let id = id.into();
        config.validate()?;
        let mut store = parts.store;
        let mut cache = None;
        if let Some(cache_config) = config.cache_config() {
            let caching = Arc::new(CachingBlobStore::new(
                id.clone(),
                store,
                cache_config,
                locks,
            )?);
            store = caching.clone();
            cache = Some(caching);
        }
        let mut transactional = None;
        if config.is_transactional() {
            let tx_store = TransactionalBlobStore::new(store, parts.transient);
            store = Arc::new(tx_store.clone());
            transactional = Some(tx_store);
        }
        tracing::debug!("blob provider {id}: {} store ready", config.kind);
        Ok(Self {
            id,
            config,
            store,
            cache,
            transactional,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &BlobProviderConfig {
        &self.config
    }

    /// Top of the store stack.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// The stack below the transactional layer.
    fn permanent_store(&self) -> &Arc<dyn BlobStore> {
        match &self.transactional {
            Some(tx_store) => tx_store.store(),
            None => &self.store,
        }
    }

    pub fn key_strategy(&self) -> Arc<dyn KeyStrategy> {
        self.store.key_strategy()
    }

    pub fn is_transient(&self) -> bool {
        self.config.transient
    }

    pub fn is_record_mode(&self) -> bool {
        self.config.record
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional.is_some()
    }

    pub fn allow_byte_range(&self) -> bool {
        self.config.allow_byte_range
    }

    pub fn supports_user_update(&self) -> bool {
        !self.config.prevent_user_update
    }

    /// Whether `user`, or one of `groups`, may create documents pointing at
    /// blobs of this provider by key alone.
    pub fn has_create_from_key_permission(&self, user: &str, groups: &[&str]) -> bool {
        let allowed = |list: &Option<String>, name: &str| {
            list.as_deref().is_some_and(|list| {
                list.split(',')
                    .map(str::trim)
                    .any(|entry| entry == "*" || entry == name)
            })
        };
        allowed(&self.config.create_from_key_users, user)
            || groups
                .iter()
                .any(|group| allowed(&self.config.create_from_key_groups, group))
    }

    fn ensure_open(&self) -> BlobResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlobError::illegal_state(format!(
                "blob provider {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    /// Store key of `key`, which may or may not carry this provider's prefix.
    pub fn store_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.id.as_str())
            .and_then(|rest| rest.strip_prefix(PROVIDER_SEP))
            .unwrap_or(key)
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{PROVIDER_SEP}{key}", self.id)
    }

    fn check_record_write(&self, doc: Option<&DocRef>) -> BlobResult<()> {
        if !self.config.record {
            return Ok(());
        }
        let doc = doc.ok_or_else(|| BlobError::InvalidKey("missing id".into()))?;
        if doc.doc_id.as_deref().is_none_or(str::is_empty) {
            return Err(BlobError::InvalidKey("missing id".into()));
        }
        if doc.xpath.as_deref() != Some(MAIN_BLOB_XPATH) {
            return Err(BlobError::unsupported(format!(
                "record blob provider {} only stores the main blob, not {}",
                self.id,
                doc.xpath.as_deref().unwrap_or("<none>")
            )));
        }
        Ok(())
    }

    fn write_to(
        &self,
        store: &dyn BlobStore,
        mut blob: Blob,
        doc: Option<&DocRef>,
    ) -> BlobResult<String> {
        self.ensure_open()?;
        self.check_record_write(doc)?;
        // keys of other providers may follow another strategy
        if blob
            .managed
            .as_ref()
            .is_some_and(|managed| managed.provider_id() != self.id)
        {
            blob.managed = None;
        }
        let ctx = match doc {
            Some(doc) => BlobContext::with_doc(blob, doc.clone()),
            None => BlobContext::new(blob),
        };
        let key = store.write_blob_context(ctx)?;
        Ok(self.prefixed(&key))
    }

    /// Stores `blob` and returns its prefixed key.
    pub fn write_blob(&self, blob: Blob, doc: Option<&DocRef>) -> BlobResult<String> {
        self.write_to(self.store.as_ref(), blob, doc)
    }

    fn read_from(&self, store: &dyn BlobStore, info: &BlobInfo) -> BlobResult<Blob> {
        self.ensure_open()?;
        let key = self.store_key(&info.key);
        let content = match store.get_file(key)? {
            OptionalOrUnknown::Present(path) => BlobContent::File(path),
            OptionalOrUnknown::Missing => return Err(BlobError::NotFound(info.key.clone())),
            OptionalOrUnknown::Unknown => match read_blob_bytes(store, key)? {
                Some(bytes) => BlobContent::Bytes(Bytes::from(bytes)),
                None => return Err(BlobError::NotFound(info.key.clone())),
            },
        };
        let mut stored = info.clone();
        stored.key = key.to_owned();
        Ok(Blob {
            content,
            filename: info.filename.clone(),
            mime_type: info.mime_type.clone(),
            encoding: info.encoding.clone(),
            digest: info.digest.clone(),
            managed: Some(ManagedBlob::with_provider(&self.id, stored)),
        })
    }

    /// Resolves a stored blob record to its bytes.
    pub fn read_blob(&self, info: &BlobInfo) -> BlobResult<Blob> {
        self.read_from(self.store.as_ref(), info)
    }

    fn transactional(&self) -> BlobResult<&TransactionalBlobStore> {
        self.transactional.as_ref().ok_or_else(|| {
            BlobError::unsupported(format!("blob provider {} is not transactional", self.id))
        })
    }

    pub fn begin_transaction(&self) -> BlobResult<BlobTransaction> {
        self.ensure_open()?;
        Ok(self.transactional()?.begin())
    }

    pub fn write_blob_in(
        &self,
        tx: &BlobTransaction,
        blob: Blob,
        doc: Option<&DocRef>,
    ) -> BlobResult<String> {
        self.write_to(tx, blob, doc)
    }

    pub fn read_blob_in(&self, tx: &BlobTransaction, info: &BlobInfo) -> BlobResult<Blob> {
        self.read_from(tx, info)
    }

    pub fn delete_blob(&self, key: &str) -> BlobResult<()> {
        self.ensure_open()?;
        self.store.delete_blob(self.store_key(key));
        Ok(())
    }

    pub fn delete_blob_in(&self, tx: &BlobTransaction, key: &str) -> BlobResult<()> {
        self.ensure_open()?;
        tx.delete(self.store_key(key))
    }

    fn check_owner(&self, blob: &ManagedBlob) -> BlobResult<()> {
        if blob.provider_id() != self.id {
            return Err(BlobError::InvalidKey(format!(
                "blob {} does not belong to provider {}",
                blob.key(),
                self.id
            )));
        }
        Ok(())
    }

    /// Stream over the bytes of `blob`. Stores that cannot stream are read
    /// through an anonymous temporary file.
    pub fn get_stream(&self, blob: &ManagedBlob) -> BlobResult<BlobReader> {
        self.ensure_open()?;
        self.check_owner(blob)?;
        match self.store.get_stream(blob.store_key())? {
            OptionalOrUnknown::Present(reader) => Ok(reader),
            OptionalOrUnknown::Missing => Err(BlobError::NotFound(blob.key().to_owned())),
            OptionalOrUnknown::Unknown => {
                let tmp = tempfile::NamedTempFile::new()?;
                if !self.store.read_blob(blob.store_key(), tmp.path())? {
                    return Err(BlobError::NotFound(blob.key().to_owned()));
                }
                let mut file = tmp.reopen()?;
                file.rewind()?;
                Ok(Box::new(file))
            }
        }
    }

    /// Local file holding the bytes of `blob`, if the store has one.
    pub fn get_file(&self, blob: &ManagedBlob) -> BlobResult<Option<PathBuf>> {
        self.ensure_open()?;
        self.check_owner(blob)?;
        Ok(self.store.get_file(blob.store_key())?.into_option())
    }

    /// `len` bytes of `blob` starting at `offset`, fewer at the end of the
    /// blob.
    pub fn get_range(&self, blob: &ManagedBlob, offset: u64, len: u64) -> BlobResult<BlobReader> {
        if !self.config.allow_byte_range {
            return Err(BlobError::unsupported(format!(
                "blob provider {} does not serve byte ranges",
                self.id
            )));
        }
        let mut reader = self.get_stream(blob)?;
        let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
        if skipped < offset {
            return Ok(Box::new(io::empty()));
        }
        Ok(Box::new(reader.take(len)))
    }

    pub fn get_status(&self, blob: &ManagedBlob) -> BlobResult<BlobStatus> {
        self.ensure_open()?;
        self.check_owner(blob)?;
        Ok(BlobStatus::default())
    }

    /// Flips legal hold or retention of a record blob.
    pub fn update_blob(&self, ctx: &BlobUpdateContext) -> BlobResult<()> {
        self.update_in(self.store.as_ref(), ctx)
    }

    pub fn update_blob_in(&self, tx: &BlobTransaction, ctx: &BlobUpdateContext) -> BlobResult<()> {
        self.update_in(tx, ctx)
    }

    fn update_in(&self, store: &dyn BlobStore, ctx: &BlobUpdateContext) -> BlobResult<()> {
        self.ensure_open()?;
        if !self.config.record {
            return Err(BlobError::unsupported(format!(
                "blob provider {} does not update blob properties",
                self.id
            )));
        }
        store.write_blob_properties(&ctx.for_key(self.store_key(&ctx.key)))
    }

    /// Copies a blob of another provider without reading it through, when
    /// the stores allow it. `None` when a regular write is needed.
    pub(crate) fn copy_from(
        &self,
        source: &BlobProvider,
        blob: &ManagedBlob,
    ) -> BlobResult<Option<String>> {
        self.ensure_open()?;
        let source_store = source.permanent_store();
        if self.config.record || !self.store.copy_blob_is_optimized(source_store.as_ref()) {
            return Ok(None);
        }
        if !self.key_strategy().same_as(source.key_strategy().as_ref())
            || !self.key_strategy().use_deduplication()
        {
            return Ok(None);
        }
        let key = blobkeep_core::blob::strip_blob_key_version(blob.store_key());
        if self
            .store
            .copy_blob(key, source_store.as_ref(), blob.store_key(), false)?
        {
            tracing::debug!("copied {} into provider {}", blob.key(), self.id);
            Ok(Some(self.prefixed(key)))
        } else {
            Ok(None)
        }
    }

    pub fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector> {
        self.store.garbage_collector()
    }

    /// One collector per storage area below this provider: the cache, if
    /// any, then the permanent store.
    pub fn garbage_collector_parts(&self) -> Vec<Arc<dyn BinaryGarbageCollector>> {
        match &self.cache {
            Some(cache) => cache.garbage_collectors().to_vec(),
            None => vec![self.permanent_store().garbage_collector()],
        }
    }

    /// Evicts old cache entries now. `None` for providers without cache.
    pub fn clear_cache(&self) -> BlobResult<Option<CacheClearReport>> {
        self.ensure_open()?;
        self.cache
            .as_ref()
            .map(|cache| cache.clear_old_blobs_now())
            .transpose()
    }

    /// Further calls fail with `IllegalState`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("blob provider {} closed", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
