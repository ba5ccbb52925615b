use blobkeep_core::{
    BlobError, BlobResult, BlobUpdateContext, BlobWriteContext, KeyStrategy, OptionalOrUnknown,
    PathStrategy,
    gc::{BinaryGarbageCollector, BinaryManagerStatus, GcRun, MarkSweepCollector, SweepBackend},
    paths::atomic_move,
    store::{BlobReader, BlobStore, copy_blob_generic},
};
use std::{
    any::Any,
    fs::{self, File},
    io::{self, BufReader, Cursor, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use walkdir::WalkDir;

pub mod encryption;

pub use encryption::Encryption;

/// Filesystem timestamps are not more precise than this on some platforms.
const TIME_RESOLUTION: Duration = Duration::from_secs(2);

/// Blob store keeping one file per key under a directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    name: String,
    key_strategy: Arc<dyn KeyStrategy>,
    path_strategy: Arc<dyn PathStrategy>,
    encryption: Option<Arc<Encryption>>,
    gc: Arc<MarkSweepCollector<LocalSweep>>,
}

impl LocalBlobStore {
    pub fn new(
        name: impl Into<String>,
        key_strategy: Arc<dyn KeyStrategy>,
        path_strategy: Arc<dyn PathStrategy>,
    ) -> Self {
        let gc = Arc::new(MarkSweepCollector::new(LocalSweep {
            path_strategy: path_strategy.clone(),
            key_strategy: key_strategy.clone(),
        }));
        LocalBlobStore {
            name: name.into(),
            key_strategy,
            path_strategy,
            encryption: None,
            gc,
        }
    }

    /// Encrypts files at rest. Local files are then never exposed.
    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = Some(Arc::new(encryption));
        self
    }

    pub fn path_strategy(&self) -> &Arc<dyn PathStrategy> {
        &self.path_strategy
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    fn same_encryption(&self, other: &LocalBlobStore) -> bool {
        match (&self.encryption, &other.encryption) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_key(b),
            _ => false,
        }
    }

    fn write_to_temp(&self, ctx: &mut BlobWriteContext, tmp: &Path) -> BlobResult<String> {
        let mut file = File::create(tmp)?;
        match &self.encryption {
            None => {
                ctx.transfer(&mut file)?;
            }
            Some(enc) => {
                let mut plain = Vec::new();
                ctx.transfer(&mut plain)?;
                file.write_all(&enc.encrypt(&plain)?)?;
            }
        }
        file.sync_all()?;
        let key = ctx.key()?;
        let dest = self.path_strategy.path_for_key(&key)?;
        if ctx.use_deduplication() && dest.exists() {
            tracing::debug!("{}: blob {key} already stored", self.name);
            remove_temp(tmp);
            return Ok(key);
        }
        atomic_move(tmp, &dest)?;
        Ok(key)
    }

    fn copy_local(
        &self,
        key: &str,
        source: &LocalBlobStore,
        source_key: &str,
        atomic: bool,
    ) -> BlobResult<bool> {
        let source_path = source.path_strategy.path_for_key(source_key)?;
        if !source_path.exists() {
            return Ok(false);
        }
        let dest = self.path_strategy.path_for_key(key)?;
        if source_path == dest {
            return Ok(true);
        }
        let result = if atomic {
            atomic_move(&source_path, &dest)
        } else {
            let tmp = self.path_strategy.create_temp_file()?;
            fs::copy(&source_path, &tmp)
                .and_then(|_| atomic_move(&tmp, &dest))
                .inspect_err(|_| remove_temp(&tmp))
        };
        match result {
            Ok(()) => Ok(true),
            // source vanished between the check and the copy
            Err(e) if e.kind() == io::ErrorKind::NotFound && !source_path.exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_decrypted(&self, enc: &Encryption, path: &Path) -> BlobResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(enc.decrypt(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!("failed to remove temp file {}: {e}", path.display());
    }
}

impl BlobStore for LocalBlobStore {
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
        if ctx.use_deduplication() && ctx.key_is_known() {
            let key = ctx.key()?;
            if self.path_strategy.path_for_key(&key)?.exists() {
                tracing::debug!("{}: blob {key} already stored", self.name);
                return Ok(key);
            }
        }
        let tmp = self.path_strategy.create_temp_file()?;
        let result = self.write_to_temp(ctx, &tmp);
        if result.is_err() {
            remove_temp(&tmp);
        }
        let key = result?;
        tracing::debug!("{}: wrote blob {key}", self.name);
        Ok(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        source
            .as_any()
            .downcast_ref::<LocalBlobStore>()
            .is_some_and(|s| self.same_encryption(s))
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool> {
        match source.as_any().downcast_ref::<LocalBlobStore>() {
            Some(local) if self.same_encryption(local) => {
                self.copy_local(key, local, source_key, atomic_move)
            }
            _ => copy_blob_generic(self, key, source, source_key, atomic_move),
        }
    }

    fn get_file(&self, key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>> {
        if self.encryption.is_some() {
            return Ok(OptionalOrUnknown::Unknown);
        }
        let path = self.path_strategy.path_for_key(key)?;
        Ok(OptionalOrUnknown::of(path.is_file().then_some(path)))
    }

    fn get_stream(&self, key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>> {
        let path = self.path_strategy.path_for_key(key)?;
        if let Some(enc) = &self.encryption {
            return Ok(OptionalOrUnknown::of(
                self.read_decrypted(enc, &path)?
                    .map(|plain| Box::new(Cursor::new(plain)) as BlobReader),
            ));
        }
        match File::open(&path) {
            Ok(file) => Ok(OptionalOrUnknown::Present(Box::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(OptionalOrUnknown::Missing),
            Err(e) => Err(e.into()),
        }
    }

    fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        let path = self.path_strategy.path_for_key(key)?;
        if let Some(enc) = &self.encryption {
            let Some(plain) = self.read_decrypted(enc, &path)? else {
                return Ok(false);
            };
            fs::write(dest, plain)?;
            return Ok(true);
        }
        match fs::copy(&path, dest) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !path.exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn write_blob_properties(&self, ctx: &BlobUpdateContext) -> BlobResult<()> {
        tracing::debug!(
            "{}: ignoring property update for {}, not supported on local files",
            self.name,
            ctx.key
        );
        Ok(())
    }

    fn delete_blob(&self, key: &str) {
        let path = match self.path_strategy.path_for_key(key) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("{}: cannot delete blob {key}: {e}", self.name);
                return;
            }
        };
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("{}: deleted blob {key}", self.name),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("{}: failed to delete {}: {e}", self.name, path.display()),
        }
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

/// Marks by touching files, sweeps every file older than the run start.
/// With a de-duplicating key strategy, files whose names are not digests
/// are left alone.
#[derive(Debug)]
pub struct LocalSweep {
    path_strategy: Arc<dyn PathStrategy>,
    key_strategy: Arc<dyn KeyStrategy>,
}

impl LocalSweep {
    /// Whether the file at `path` holds a blob this store may collect.
    fn is_collectable(&self, path: &Path) -> bool {
        match self.path_strategy.key_for_path(path) {
            Ok(Some(key)) => {
                !self.key_strategy.use_deduplication()
                    || self.key_strategy.digest_from_key(&key).is_some()
            }
            Ok(None) => false,
            // hashed paths, every file is an entry
            Err(BlobError::Unsupported(_)) => true,
            Err(e) => {
                tracing::debug!("gc: skipping {}: {e}", path.display());
                false
            }
        }
    }
}

impl SweepBackend for LocalSweep {
    fn id(&self) -> String {
        format!("local:{}", self.path_strategy.dir().display())
    }

    fn mark(&self, key: &str, _run: &mut GcRun) -> BlobResult<()> {
        let path = match self.path_strategy.path_for_key(key) {
            Ok(path) => path,
            Err(BlobError::InvalidKey(_)) => {
                tracing::debug!("gc: ignoring invalid key {key}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let touched = File::options()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(SystemTime::now()));
        match touched {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("gc: marked blob {key} does not exist");
            }
            Err(e) => tracing::warn!("gc: failed to touch {}: {e}", path.display()),
        }
        Ok(())
    }

    fn sweep(&self, run: &GcRun, status: &mut BinaryManagerStatus, delete: bool) -> BlobResult<()> {
        let threshold = run
            .start_time
            .checked_sub(TIME_RESOLUTION)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let root = self.path_strategy.dir();
        if !root.exists() {
            return Ok(());
        }
        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("gc: cannot walk {}: {e}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || self.path_strategy.is_temp_file(entry.path())
                || !self.is_collectable(entry.path())
            {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!("gc: cannot stat {}: {e}", entry.path().display());
                    continue;
                }
            };
            let size = meta.len();
            let modified = meta.modified()?;
            if modified >= threshold {
                status.keep(size);
                continue;
            }
            status.collect(size);
            if delete && let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("gc: failed to delete {}: {e}", entry.path().display());
            }
        }
        if delete {
            prune_empty_dirs(root);
        }
        Ok(())
    }
}

fn prune_empty_dirs(root: &Path) {
    for entry in WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .flatten()
    {
        if entry.file_type().is_dir() {
            // fails unless empty
            let _ = fs::remove_dir(entry.path());
        }
    }
}
