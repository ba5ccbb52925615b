use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use blobkeep_core::{
    Blob, BlobError, BlobInfo, BlobResult, DocRef, EmptyBlobStore, KeyStrategy,
    KeyStrategyDigest, KeyStrategyDocId, KeyStrategyManaged, PathStrategy, PathStrategyFlat,
    PathStrategySubDirs,
    blob::PROVIDER_SEP,
    gc::{BinaryGarbageCollector, BinaryManagerStatus},
};
use blobkeep_store_caching::FileLocks;
use blobkeep_store_local::LocalBlobStore;
use blobkeep_store_memory::InMemoryBlobStore;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    config::{BlobProviderConfig, KeyStrategyKind, ManagerConfig},
    provider::{BlobProvider, StoreParts},
};

/// Provider of keys stored without a provider prefix.
pub const DEFAULT_PROVIDER: &str = "default";

/// What a store factory gets to build the stores of one provider.
#[derive(Debug)]
pub struct FactoryContext<'a> {
    pub id: &'a str,
    pub config: &'a BlobProviderConfig,
    pub key_strategy: Arc<dyn KeyStrategy>,
}

pub type StoreFactory = Arc<dyn Fn(&FactoryContext<'_>) -> BlobResult<StoreParts> + Send + Sync>;

/// Registry of blob providers, by id.
///
/// Providers are built from their configuration on first lookup, and closed
/// when unregistered or redefined. Every cache of every provider shares the
/// manager's [`FileLocks`].
pub struct BlobManager {
    factories: HashMap<String, StoreFactory>,
    configs: DashMap<String, BlobProviderConfig>,
    providers: DashMap<String, Arc<BlobProvider>>,
    locks: Arc<FileLocks>,
}

impl fmt::Debug for BlobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut factories: Vec<&String> = self.factories.keys().collect();
        factories.sort();
        f.debug_struct("BlobManager")
            .field("factories", &factories)
            .field("configs", &self.configs)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl Default for BlobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobManager {
    /// Manager knowing the `local`, `memory` and `cache_only` store types.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            configs: DashMap::new(),
            providers: DashMap::new(),
            locks: Arc::new(FileLocks::new()),
        }
        .with_factory("local", local_store)
        .with_factory("memory", memory_store)
        .with_factory("cache_only", cache_only_store)
    }

    /// Registers every provider of `config`.
    pub fn from_config(config: &ManagerConfig) -> BlobResult<Self> {
        let manager = Self::new();
        for (id, provider) in &config.provider {
            manager.register(id, provider.clone())?;
        }
        Ok(manager)
    }

    /// Makes the store type `kind` available to provider configurations.
    pub fn with_factory(
        mut self,
        kind: impl Into<String>,
        factory: impl Fn(&FactoryContext<'_>) -> BlobResult<StoreParts> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn file_locks(&self) -> &Arc<FileLocks> {
        &self.locks
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Defines provider `id`, replacing and closing a previous definition.
    pub fn register(&self, id: &str, config: BlobProviderConfig) -> BlobResult<()> {
        if id.is_empty() || id.contains(PROVIDER_SEP) {
            return Err(BlobError::config(format!("invalid blob provider id {id:?}")));
        }
        config.validate()?;
        if !self.factories.contains_key(&config.kind) {
            return Err(BlobError::config(format!(
                "unknown blob provider type {} for {id}",
                config.kind
            )));
        }
        self.configs.insert(id.to_owned(), config);
        if let Some((_, previous)) = self.providers.remove(id) {
            tracing::debug!("blob provider {id} redefined");
            previous.close();
        }
        Ok(())
    }

    /// Returns false if no provider `id` was registered.
    pub fn unregister(&self, id: &str) -> bool {
        let known = self.configs.remove(id).is_some();
        if let Some((_, provider)) = self.providers.remove(id) {
            provider.close();
        }
        known
    }

    pub fn get_blob_provider(&self, id: &str) -> BlobResult<Arc<BlobProvider>> {
        if let Some(provider) = self.providers.get(id) {
            return Ok(provider.clone());
        }
        let config = self
            .configs
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| BlobError::config(format!("no blob provider {id}")))?;
        match self.providers.entry(id.to_owned()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let provider = Arc::new(self.instantiate(id, config)?);
                vacant.insert(provider.clone());
                Ok(provider)
            }
        }
    }

    /// Provider owning `key`, from its prefix. Unprefixed keys belong to
    /// [`DEFAULT_PROVIDER`].
    pub fn get_blob_provider_for_key(&self, key: &str) -> BlobResult<Arc<BlobProvider>> {
        self.get_blob_provider(provider_id_of(key))
    }

    fn instantiate(&self, id: &str, config: BlobProviderConfig) -> BlobResult<BlobProvider> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            BlobError::config(format!("unknown blob provider type {}", config.kind))
        })?;
        let ctx = FactoryContext {
            id,
            config: &config,
            key_strategy: key_strategy(&config)?,
        };
        let parts = factory(&ctx)?;
        tracing::info!("blob provider {id} initialized ({})", config.kind);
        BlobProvider::new(id, config, parts, self.locks.clone())
    }

    pub fn read_blob(&self, info: &BlobInfo) -> BlobResult<Blob> {
        self.get_blob_provider_for_key(&info.key)?.read_blob(info)
    }

    /// Stores `blob` with provider `provider_id` and returns the prefixed
    /// key. Blobs already stored by another provider are copied store to
    /// store when possible.
    pub fn write_blob(
        &self,
        provider_id: &str,
        blob: Blob,
        doc: Option<&DocRef>,
    ) -> BlobResult<String> {
        let provider = self.get_blob_provider(provider_id)?;
        if let Some(managed) = &blob.managed
            && managed.provider_id() != provider_id
            && let Ok(source) = self.get_blob_provider(managed.provider_id())
            && let Some(key) = provider.copy_from(&source, managed)?
        {
            return Ok(key);
        }
        provider.write_blob(blob, doc)
    }

    pub fn delete_blob(&self, key: &str) -> BlobResult<()> {
        self.get_blob_provider_for_key(key)?.delete_blob(key)
    }

    /// Runs one garbage collection over every non-transient provider.
    ///
    /// `live_keys` are prefixed keys still referenced; everything else is
    /// garbage. Providers sharing storage share one collector, and so one
    /// status.
    pub fn collect_garbage<'a>(
        &self,
        live_keys: impl IntoIterator<Item = &'a str>,
        delete: bool,
    ) -> BlobResult<BTreeMap<String, BinaryManagerStatus>> {
        // one run per storage area, even when reached through several
        // providers with and without a cache in front
        let mut collectors: Vec<Arc<dyn BinaryGarbageCollector>> = Vec::new();
        let mut by_provider: HashMap<String, Vec<usize>> = HashMap::new();
        for id in self.provider_ids() {
            let provider = self.get_blob_provider(&id)?;
            if provider.is_transient() {
                continue;
            }
            let mut parts = Vec::new();
            for gc in provider.garbage_collector_parts() {
                let gc_id = gc.id();
                let index = match collectors.iter().position(|c| c.id() == gc_id) {
                    Some(index) => index,
                    None => {
                        collectors.push(gc);
                        collectors.len() - 1
                    }
                };
                parts.push(index);
            }
            by_provider.insert(id, parts);
        }

        for (i, gc) in collectors.iter().enumerate() {
            if let Err(e) = gc.start() {
                abort_collectors(&collectors[..i]);
                return Err(e);
            }
        }

        let mut marked = 0u64;
        for key in live_keys {
            let Some(parts) = by_provider.get(provider_id_of(key)) else {
                tracing::debug!("gc: no collected provider for {key}");
                continue;
            };
            let store_key = key.split_once(PROVIDER_SEP).map_or(key, |(_, k)| k);
            for &index in parts {
                if let Err(e) = collectors[index].mark(store_key) {
                    abort_collectors(&collectors);
                    return Err(e);
                }
            }
            marked += 1;
        }

        let mut results = Vec::with_capacity(collectors.len());
        let mut first_err = None;
        for gc in &collectors {
            match gc.stop(delete) {
                Ok(status) => results.push(status),
                Err(e) => {
                    tracing::warn!("gc: stopping {} failed: {e}", gc.id());
                    first_err.get_or_insert(e);
                    results.push(BinaryManagerStatus::default());
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        let statuses: BTreeMap<String, BinaryManagerStatus> = by_provider
            .into_iter()
            .map(|(id, parts)| {
                let mut status = BinaryManagerStatus::default();
                for index in parts {
                    status.merge(&results[index]);
                    status.gc_duration = status.gc_duration.max(results[index].gc_duration);
                }
                (id, status)
            })
            .collect();
        tracing::info!(
            "gc: {marked} live keys over {} providers, delete={delete}",
            statuses.len()
        );
        Ok(statuses)
    }

    /// Whether a garbage collection runs on any provider built so far.
    pub fn is_garbage_collection_in_progress(&self) -> bool {
        self.providers
            .iter()
            .any(|provider| provider.value().garbage_collector().is_in_progress())
    }

    /// Closes every provider and forgets every definition.
    pub fn close(&self) {
        for entry in self.providers.iter() {
            entry.value().close();
        }
        self.providers.clear();
        self.configs.clear();
    }
}

/// Stops collectors of a run that cannot complete, without sweeping.
fn abort_collectors(collectors: &[Arc<dyn BinaryGarbageCollector>]) {
    for gc in collectors {
        if gc.is_in_progress()
            && let Err(e) = gc.stop(false)
        {
            tracing::warn!("gc: failed to abort {}: {e}", gc.id());
        }
    }
}

fn provider_id_of(key: &str) -> &str {
    key.split_once(PROVIDER_SEP)
        .map_or(DEFAULT_PROVIDER, |(id, _)| id)
}

fn key_strategy(config: &BlobProviderConfig) -> BlobResult<Arc<dyn KeyStrategy>> {
    Ok(match config.key_strategy_kind() {
        // rewrites of a blob of the same provider reuse its key
        KeyStrategyKind::Digest => Arc::new(KeyStrategyManaged::new(Arc::new(
            KeyStrategyDigest::new(config.digest_algorithm()?),
        ))),
        KeyStrategyKind::DocId => Arc::new(KeyStrategyDocId),
    })
}

fn no_encryption(ctx: &FactoryContext<'_>) -> BlobResult<()> {
    if ctx.config.encryption.is_some() {
        return Err(BlobError::config(format!(
            "blob provider {}: encryption needs a local store",
            ctx.id
        )));
    }
    Ok(())
}

/// Files under `<path>[_<namespace>]/data`, transactions staged under
/// `<path>[_<namespace>]/tmp`.
pub fn local_store(ctx: &FactoryContext<'_>) -> BlobResult<StoreParts> {
    let root = ctx.config.root_dir().ok_or_else(|| {
        BlobError::config(format!("local blob provider {} requires a path", ctx.id))
    })?;
    let data = root.join("data");
    let paths: Arc<dyn PathStrategy> = match ctx.config.subdirs_depth {
        Some(depth) => Arc::new(PathStrategySubDirs::new(data, depth)),
        None => Arc::new(PathStrategyFlat::new(data)),
    };
    paths.ensure_dirs()?;
    let transient_paths: Arc<dyn PathStrategy> = Arc::new(PathStrategyFlat::new(root.join("tmp")));
    transient_paths.ensure_dirs()?;

    let mut store = LocalBlobStore::new(ctx.id, ctx.key_strategy.clone(), paths);
    let mut transient = LocalBlobStore::new(
        format!("{}-transient", ctx.id),
        ctx.key_strategy.clone(),
        transient_paths,
    );
    if let Some(encryption) = &ctx.config.encryption {
        let encryption = encryption.to_encryption()?;
        store = store.with_encryption(encryption.clone());
        transient = transient.with_encryption(encryption);
    }
    Ok(StoreParts {
        store: Arc::new(store),
        transient: Arc::new(transient),
    })
}

pub fn memory_store(ctx: &FactoryContext<'_>) -> BlobResult<StoreParts> {
    no_encryption(ctx)?;
    Ok(StoreParts {
        store: Arc::new(InMemoryBlobStore::new(ctx.id, ctx.key_strategy.clone())),
        transient: Arc::new(InMemoryBlobStore::new(
            format!("{}-transient", ctx.id),
            ctx.key_strategy.clone(),
        )),
    })
}

/// Bytes only live in the cache.
pub fn cache_only_store(ctx: &FactoryContext<'_>) -> BlobResult<StoreParts> {
    no_encryption(ctx)?;
    if ctx.config.cache.is_none() {
        return Err(BlobError::config(format!(
            "cache_only blob provider {} requires a cache section",
            ctx.id
        )));
    }
    Ok(StoreParts {
        store: Arc::new(EmptyBlobStore::new(ctx.id, ctx.key_strategy.clone())),
        transient: Arc::new(InMemoryBlobStore::new(
            format!("{}-transient", ctx.id),
            ctx.key_strategy.clone(),
        )),
    })
}
