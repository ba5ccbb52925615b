//! Transactional staging of blob writes.
//!
//! Inside a [`BlobTransaction`], writes go to a transient store under random
//! keys and deletes are only recorded. Nothing touches the permanent store
//! until commit. A key touched by one open transaction cannot be touched by
//! another one until the first completes.

use blobkeep_core::{
    BlobError, BlobResult, BlobUpdateContext, BlobWriteContext, KeyStrategy, OptionalOrUnknown,
    gc::BinaryGarbageCollector,
    store::{BlobReader, BlobStore},
};
use dashmap::{DashMap, mapref::entry::Entry};
use std::{
    any::Any,
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

#[derive(Debug)]
struct Inner {
    name: String,
    store: Arc<dyn BlobStore>,
    /// Same as `store` when it has versioning.
    transient: Arc<dyn BlobStore>,
    /// Key to id of the transaction that owns it.
    owners: DashMap<String, u64>,
    next_id: AtomicU64,
}

impl Inner {
    fn stages_in_place(&self) -> bool {
        self.store.has_versioning()
    }
}

/// A permanent store plus a transient one used to stage transactional writes.
///
/// Outside of a transaction, all calls go straight to the permanent store.
#[derive(Debug, Clone)]
pub struct TransactionalBlobStore {
    inner: Arc<Inner>,
}

impl TransactionalBlobStore {
    pub fn new(store: Arc<dyn BlobStore>, transient: Arc<dyn BlobStore>) -> Self {
        let transient = if store.has_versioning() {
            // versioned keys never collide, stage directly
            store.clone()
        } else {
            transient
        };
        Self {
            inner: Arc::new(Inner {
                name: store.name().to_owned(),
                store,
                transient,
                owners: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.inner.store
    }

    pub fn transient(&self) -> &Arc<dyn BlobStore> {
        &self.inner.transient
    }

    pub fn begin(&self) -> BlobTransaction {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("{}: begin transaction {id}", self.inner.name);
        BlobTransaction {
            id,
            inner: self.inner.clone(),
            state: Mutex::new(TxState::default()),
        }
    }

    /// Id of the open transaction owning `key`, if any.
    pub fn owner_of(&self, key: &str) -> Option<u64> {
        self.inner.owners.get(key).map(|id| *id)
    }
}

impl BlobStore for TransactionalBlobStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn has_versioning(&self) -> bool {
        self.inner.store.has_versioning()
    }

    fn key_strategy(&self) -> Arc<dyn KeyStrategy> {
        self.inner.store.key_strategy()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext) -> BlobResult<String> {
        self.inner.store.write_blob(ctx)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.inner.store.copy_blob_is_optimized(source)
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool> {
        self.inner
            .store
            .copy_blob(key, source, source_key, atomic_move)
    }

    fn get_file(&self, key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>> {
        self.inner.store.get_file(key)
    }

    fn get_stream(&self, key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>> {
        self.inner.store.get_stream(key)
    }

    fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        self.inner.store.read_blob(key, dest)
    }

    fn write_blob_properties(&self, ctx: &BlobUpdateContext) -> BlobResult<()> {
        self.inner.store.write_blob_properties(ctx)
    }

    fn delete_blob(&self, key: &str) {
        self.inner.store.delete_blob(key)
    }

    fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector> {
        self.inner.store.garbage_collector()
    }

    fn unwrapped(&self) -> &dyn BlobStore {
        self.inner.store.unwrapped()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Staged {
    /// Bytes wait under `transient_key`. `in_place` when they were written
    /// to the permanent store directly.
    Write { transient_key: String, in_place: bool },
    Delete,
}

#[derive(Debug, Default)]
struct KeyState {
    staged: Option<Staged>,
    properties: Option<BlobUpdateContext>,
}

#[derive(Debug, Default)]
struct TxState {
    keys: BTreeMap<String, KeyState>,
    completed: bool,
}

/// Outcome of a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub committed: usize,
    /// Keys whose staged changes could not be applied. The transaction is
    /// committed regardless.
    pub failed: Vec<String>,
}

/// An open transaction on a [`TransactionalBlobStore`].
///
/// Reads through the handle see its own staged changes first. Dropping a
/// handle that was neither committed nor rolled back rolls it back.
#[derive(Debug)]
pub struct BlobTransaction {
    id: u64,
    inner: Arc<Inner>,
    state: Mutex<TxState>,
}

impl BlobTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> BlobResult<()> {
        if self.lock().completed {
            return Err(BlobError::illegal_state(format!(
                "transaction {} already completed",
                self.id
            )));
        }
        Ok(())
    }

    /// Makes this transaction the owner of `key`, failing if another open
    /// transaction owns it.
    fn claim(&self, key: &str) -> BlobResult<()> {
        match self.inner.owners.entry(key.to_owned()) {
            Entry::Occupied(owner) if *owner.get() != self.id => {
                tracing::debug!(
                    "{}: transaction {} lost {key} to transaction {}",
                    self.inner.name,
                    self.id,
                    owner.get()
                );
                Err(BlobError::ConcurrentUpdate {
                    key: key.to_owned(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(self.id);
                Ok(())
            }
        }
    }

    fn release(&self, key: &str) {
        self.inner.owners.remove_if(key, |_, owner| *owner == self.id);
    }

    fn staged(&self, key: &str) -> Option<Staged> {
        self.lock().keys.get(key).and_then(|k| k.staged.clone())
    }

    /// Records a staged change, discarding the bytes of the one it replaces.
    fn stage(&self, key: &str, staged: Staged) {
        let previous = {
            let mut state = self.lock();
            let entry = state.keys.entry(key.to_owned()).or_default();
            entry.staged.replace(staged)
        };
        if let Some(Staged::Write { transient_key, .. }) = previous {
            self.discard(&transient_key);
        }
    }

    fn discard(&self, transient_key: &str) {
        self.inner.transient.delete_blob(transient_key);
    }

    /// Stages the deletion of `key`.
    pub fn delete(&self, key: &str) -> BlobResult<()> {
        self.ensure_open()?;
        self.claim(key)?;
        self.stage(key, Staged::Delete);
        Ok(())
    }

    /// Applies every staged change to the permanent store.
    ///
    /// Failures are logged and reported per key but never undo other keys:
    /// by the time this runs, the enclosing transaction has been decided.
    pub fn commit(&self) -> BlobResult<CommitReport> {
        let keys = self.complete()?;
        let mut report = CommitReport::default();
        for (key, state) in keys {
            match self.commit_key(&key, state) {
                Ok(()) => report.committed += 1,
                Err(e) => {
                    tracing::error!(
                        "{}: transaction {} failed to commit blob {key}, data may be lost: {e}",
                        self.inner.name,
                        self.id
                    );
                    report.failed.push(key.clone());
                }
            }
            self.release(&key);
        }
        tracing::debug!(
            "{}: committed transaction {} ({} keys, {} failed)",
            self.inner.name,
            self.id,
            report.committed,
            report.failed.len()
        );
        Ok(report)
    }

    fn commit_key(&self, key: &str, state: KeyState) -> BlobResult<()> {
        let store = &self.inner.store;
        match state.staged {
            Some(Staged::Delete) => {
                store.delete_blob(key);
                return Ok(());
            }
            Some(Staged::Write {
                transient_key,
                in_place: false,
            }) => {
                if !store.copy_blob(key, self.inner.transient.as_ref(), &transient_key, true)? {
                    return Err(BlobError::illegal_state(format!(
                        "staged blob {transient_key} is missing"
                    )));
                }
            }
            Some(Staged::Write { in_place: true, .. }) | None => {}
        }
        if let Some(update) = state.properties {
            store.write_blob_properties(&update.for_key(key))?;
        }
        Ok(())
    }

    /// Discards every staged change.
    pub fn rollback(&self) -> BlobResult<()> {
        let keys = self.complete()?;
        for (key, state) in keys {
            if let Some(Staged::Write { transient_key, .. }) = state.staged {
                self.discard(&transient_key);
            }
            self.release(&key);
        }
        tracing::debug!("{}: rolled back transaction {}", self.inner.name, self.id);
        Ok(())
    }

    /// Completion callback of an enclosing transaction manager.
    pub fn after_completion(&self, committed: bool) -> BlobResult<CommitReport> {
        if committed {
            self.commit()
        } else {
            self.rollback().map(|()| CommitReport::default())
        }
    }

    fn complete(&self) -> BlobResult<BTreeMap<String, KeyState>> {
        let mut state = self.lock();
        if state.completed {
            return Err(BlobError::illegal_state(format!(
                "transaction {} already completed",
                self.id
            )));
        }
        state.completed = true;
        Ok(std::mem::take(&mut state.keys))
    }

    /// Writes the bytes to a local file so that the key is known before
    /// anything reaches a store.
    fn materialize(
        ctx: &mut BlobWriteContext,
    ) -> BlobResult<Option<tempfile::TempPath>> {
        if ctx.key_is_known() && ctx.file().is_some() {
            return Ok(None);
        }
        let tmp = tempfile::Builder::new()
            .prefix("bin_")
            .suffix(".tmp")
            .tempfile()?
            .into_temp_path();
        ctx.transfer_to(&tmp)?;
        Ok(Some(tmp))
    }
}

impl Drop for BlobTransaction {
    fn drop(&mut self) {
        if !self.lock().completed {
            tracing::debug!(
                "{}: transaction {} dropped without completion",
                self.inner.name,
                self.id
            );
            if let Err(e) = self.rollback() {
                tracing::warn!("{}: rollback of {} failed: {e}", self.inner.name, self.id);
            }
        }
    }
}

impl BlobStore for BlobTransaction {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn has_versioning(&self) -> bool {
        self.inner.store.has_versioning()
    }

    fn key_strategy(&self) -> Arc<dyn KeyStrategy> {
        self.inner.store.key_strategy()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext) -> BlobResult<String> {
        self.ensure_open()?;
        if self.inner.stages_in_place() {
            let key = self.inner.store.write_blob(ctx)?;
            self.claim(&key)?;
            self.stage(
                &key,
                Staged::Write {
                    transient_key: key.clone(),
                    in_place: true,
                },
            );
            return Ok(key);
        }
        let _tmp = Self::materialize(ctx)?;
        let key = ctx.key()?;
        // before any bytes are staged, so that a losing writer leaves nothing
        self.claim(&key)?;
        let transient_key = uuid::Uuid::new_v4().simple().to_string();
        let file = ctx
            .file()
            .ok_or_else(|| BlobError::illegal_state("blob was not materialized"))?
            .to_path_buf();
        let mut staged_ctx = BlobWriteContext::for_file(file, transient_key.clone());
        if let Err(e) = self.inner.transient.write_blob(&mut staged_ctx) {
            if self.staged(&key).is_none() {
                self.release(&key);
            }
            return Err(e);
        }
        self.stage(
            &key,
            Staged::Write {
                transient_key,
                in_place: false,
            },
        );
        tracing::debug!("{}: transaction {} staged {key}", self.inner.name, self.id);
        Ok(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.inner.transient.copy_blob_is_optimized(source)
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> BlobResult<bool> {
        self.ensure_open()?;
        self.claim(key)?;
        let in_place = self.inner.stages_in_place();
        let transient_key = if in_place {
            key.to_owned()
        } else {
            uuid::Uuid::new_v4().simple().to_string()
        };
        let found =
            match self
                .inner
                .transient
                .copy_blob(&transient_key, source, source_key, atomic_move)
            {
                Ok(found) => found,
                Err(e) => {
                    if self.staged(key).is_none() {
                        self.release(key);
                    }
                    return Err(e);
                }
            };
        if !found {
            if self.staged(key).is_none() {
                self.release(key);
            }
            return Ok(false);
        }
        self.stage(
            key,
            Staged::Write {
                transient_key,
                in_place,
            },
        );
        Ok(true)
    }

    fn get_file(&self, key: &str) -> BlobResult<OptionalOrUnknown<PathBuf>> {
        match self.staged(key) {
            Some(Staged::Write { transient_key, .. }) => {
                self.inner.transient.get_file(&transient_key)
            }
            Some(Staged::Delete) => Ok(OptionalOrUnknown::Missing),
            None => self.inner.store.get_file(key),
        }
    }

    fn get_stream(&self, key: &str) -> BlobResult<OptionalOrUnknown<BlobReader>> {
        match self.staged(key) {
            Some(Staged::Write { transient_key, .. }) => {
                self.inner.transient.get_stream(&transient_key)
            }
            Some(Staged::Delete) => Ok(OptionalOrUnknown::Missing),
            None => self.inner.store.get_stream(key),
        }
    }

    fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        match self.staged(key) {
            Some(Staged::Write { transient_key, .. }) => {
                self.inner.transient.read_blob(&transient_key, dest)
            }
            Some(Staged::Delete) => Ok(false),
            None => self.inner.store.read_blob(key, dest),
        }
    }

    fn write_blob_properties(&self, ctx: &BlobUpdateContext) -> BlobResult<()> {
        self.ensure_open()?;
        self.claim(&ctx.key)?;
        let mut state = self.lock();
        let entry = state.keys.entry(ctx.key.clone()).or_default();
        let merged = match entry.properties.take() {
            Some(mut pending) => {
                if ctx.update_retain_until.is_some() {
                    pending.update_retain_until = ctx.update_retain_until;
                }
                if ctx.update_legal_hold.is_some() {
                    pending.update_legal_hold = ctx.update_legal_hold;
                }
                pending
            }
            None => ctx.clone(),
        };
        entry.properties = Some(merged);
        Ok(())
    }

    fn delete_blob(&self, key: &str) {
        if let Err(e) = self.delete(key) {
            tracing::warn!(
                "{}: transaction {} cannot delete {key}: {e}",
                self.inner.name,
                self.id
            );
        }
    }

    fn garbage_collector(&self) -> Arc<dyn BinaryGarbageCollector> {
        self.inner.store.garbage_collector()
    }

    fn unwrapped(&self) -> &dyn BlobStore {
        self.inner.store.unwrapped()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobkeep_core::{
        Blob, BlobContext, DigestAlgorithm, DocRef, KeyStrategyDigest, KeyStrategyDocId,
        paths::PathStrategyFlat,
        store::read_blob_bytes,
        testutil::BlobStoreTests,
    };
    use blobkeep_store_local::LocalBlobStore;
    use blobkeep_store_memory::InMemoryBlobStore;
    use std::sync::Barrier;

    struct Fixture {
        store: Arc<InMemoryBlobStore>,
        transient: Arc<InMemoryBlobStore>,
        tx_store: TransactionalBlobStore,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBlobStore::new("perm", Arc::new(KeyStrategyDocId)));
        let transient = Arc::new(InMemoryBlobStore::new("tmp", Arc::new(KeyStrategyDocId)));
        let tx_store = TransactionalBlobStore::new(store.clone(), transient.clone());
        Fixture {
            store,
            transient,
            tx_store,
        }
    }

    fn write(store: &dyn BlobStore, doc_id: &str, data: &'static [u8]) -> BlobResult<String> {
        store.write_blob_context(BlobContext::with_doc(
            Blob::from_bytes(data),
            DocRef::new(doc_id, "content"),
        ))
    }

    fn read(store: &dyn BlobStore, key: &str) -> Option<Vec<u8>> {
        read_blob_bytes(store, key).unwrap()
    }

    #[test]
    fn test_forwards_outside_transaction() {
        let f = fixture();
        BlobStoreTests::new(&f.tx_store).run_all().unwrap();
        assert!(f.transient.is_empty());
    }

    #[test]
    fn test_transaction_conformance() {
        let f = fixture();
        let tx = f.tx_store.begin();
        BlobStoreTests::new(&tx).run_all().unwrap();
        tx.rollback().unwrap();
        assert!(f.store.is_empty());
        assert!(f.transient.is_empty());
    }

    #[test]
    fn test_commit_publishes_staged_writes() {
        let f = fixture();
        let tx = f.tx_store.begin();
        let key = write(&tx, "doc1", b"hello").unwrap();
        assert_eq!(key, "doc1");

        assert_eq!(read(&tx, &key).as_deref(), Some(&b"hello"[..]));
        assert_eq!(read(&f.tx_store, &key), None);
        assert!(!f.store.contains("doc1"));
        assert_eq!(f.transient.len(), 1);
        assert_eq!(f.tx_store.owner_of("doc1"), Some(tx.id()));

        let report = tx.commit().unwrap();
        assert_eq!(report.committed, 1);
        assert!(report.failed.is_empty());
        assert_eq!(read(&f.tx_store, &key).as_deref(), Some(&b"hello"[..]));
        assert!(f.transient.is_empty());
        assert_eq!(f.tx_store.owner_of("doc1"), None);
    }

    #[test]
    fn test_rollback_discards_staged_writes() {
        let f = fixture();
        write(f.store.as_ref(), "doc1", b"before").unwrap();

        let tx = f.tx_store.begin();
        write(&tx, "doc1", b"after").unwrap();
        write(&tx, "doc2", b"new").unwrap();
        tx.delete("doc1").unwrap();
        assert_eq!(read(&tx, "doc1"), None);
        tx.rollback().unwrap();

        assert_eq!(read(f.store.as_ref(), "doc1").as_deref(), Some(&b"before"[..]));
        assert!(!f.store.contains("doc2"));
        assert!(f.transient.is_empty());
        assert!(matches!(tx.commit(), Err(BlobError::IllegalState(_))));
    }

    #[test]
    fn test_staged_delete_applies_on_commit() {
        let f = fixture();
        write(f.store.as_ref(), "doc1", b"data").unwrap();
        let tx = f.tx_store.begin();
        tx.delete_blob("doc1");
        assert!(f.store.contains("doc1"));
        tx.commit().unwrap();
        assert!(!f.store.contains("doc1"));
    }

    #[test]
    fn test_rewrite_within_transaction_keeps_last() {
        let f = fixture();
        let tx = f.tx_store.begin();
        write(&tx, "doc1", b"first").unwrap();
        write(&tx, "doc1", b"second").unwrap();
        assert_eq!(f.transient.len(), 1);
        tx.commit().unwrap();
        assert_eq!(read(f.store.as_ref(), "doc1").as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn test_drop_rolls_back() {
        let f = fixture();
        {
            let tx = f.tx_store.begin();
            write(&tx, "doc1", b"data").unwrap();
        }
        assert!(f.transient.is_empty());
        assert!(!f.store.contains("doc1"));
        assert_eq!(f.tx_store.owner_of("doc1"), None);
    }

    #[test]
    fn test_after_completion() {
        let f = fixture();
        let tx = f.tx_store.begin();
        write(&tx, "doc1", b"data").unwrap();
        assert_eq!(tx.after_completion(false).unwrap(), CommitReport::default());
        assert!(!f.store.contains("doc1"));

        let tx = f.tx_store.begin();
        write(&tx, "doc1", b"data").unwrap();
        assert_eq!(tx.after_completion(true).unwrap().committed, 1);
        assert!(f.store.contains("doc1"));
    }

    #[test]
    fn test_concurrent_update_is_detected() {
        let f = fixture();
        let tx1 = f.tx_store.begin();
        let tx2 = f.tx_store.begin();
        let barrier = Barrier::new(2);

        let results: Vec<BlobResult<String>> = std::thread::scope(|s| {
            let handles = [(&tx1, &b"one"[..]), (&tx2, &b"two"[..])].map(|(tx, data)| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    tx.write_blob_context(BlobContext::with_doc(
                        Blob::from_bytes(data),
                        DocRef::new("doc1", "content"),
                    ))
                })
            });
            handles.map(|h| h.join().unwrap()).into_iter().collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| r.as_ref().is_err_and(|e| e.is_concurrent_update()))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 1);
        // the loser staged nothing
        assert_eq!(f.transient.len(), 1);

        tx1.commit().unwrap();
        tx2.commit().unwrap();
        assert!(f.transient.is_empty());
        let content = read(f.store.as_ref(), "doc1").unwrap();
        assert!(content == b"one" || content == b"two");
    }

    #[test]
    fn test_key_is_free_after_completion() {
        let f = fixture();
        let tx1 = f.tx_store.begin();
        write(&tx1, "doc1", b"one").unwrap();

        let tx2 = f.tx_store.begin();
        let err = write(&tx2, "doc1", b"two").unwrap_err();
        assert!(err.is_concurrent_update());
        assert!(tx2.delete("doc1").unwrap_err().is_concurrent_update());

        tx1.commit().unwrap();
        write(&tx2, "doc1", b"two").unwrap();
        tx2.commit().unwrap();
        assert_eq!(read(f.store.as_ref(), "doc1").as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_properties_are_applied_after_copy() {
        let f = fixture();
        let tx = f.tx_store.begin();
        write(&tx, "doc1", b"data").unwrap();
        tx.write_blob_properties(&BlobUpdateContext::new("doc1").with_update_legal_hold(true))
            .unwrap();
        assert_eq!(f.store.properties("doc1"), None);
        tx.commit().unwrap();
        assert!(f.store.properties("doc1").unwrap().legal_hold);
    }

    #[test]
    fn test_commit_reports_lost_blobs() {
        let f = fixture();
        let tx = f.tx_store.begin();
        write(&tx, "doc1", b"data").unwrap();
        write(&tx, "doc2", b"data").unwrap();
        // lose the staged bytes of both keys behind the transaction's back
        for key in f.transient.keys() {
            f.transient.delete_blob(&key);
        }
        let report = tx.commit().unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(report.failed, vec!["doc1".to_owned(), "doc2".to_owned()]);
        assert_eq!(f.tx_store.owner_of("doc1"), None);
    }

    #[test]
    fn test_versioned_store_stages_in_place() {
        let store = Arc::new(
            InMemoryBlobStore::new("perm", Arc::new(KeyStrategyDocId)).with_versioning(true),
        );
        let transient = Arc::new(InMemoryBlobStore::new("tmp", Arc::new(KeyStrategyDocId)));
        let tx_store = TransactionalBlobStore::new(store.clone(), transient.clone());

        let tx = tx_store.begin();
        let kept = write(&tx, "doc1", b"v1").unwrap();
        assert!(store.contains(&kept));
        tx.commit().unwrap();
        assert!(store.contains(&kept));

        let tx = tx_store.begin();
        let dropped = write(&tx, "doc1", b"v2").unwrap();
        assert_ne!(kept, dropped);
        tx.rollback().unwrap();
        assert!(!store.contains(&dropped));
        assert!(store.contains(&kept));
        assert!(transient.is_empty());
    }

    #[test]
    fn test_local_stores_with_digest_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Arc::new(KeyStrategyDigest::new(DigestAlgorithm::Md5));
        let store = Arc::new(LocalBlobStore::new(
            "perm",
            ks.clone(),
            Arc::new(PathStrategyFlat::new(dir.path().join("data"))),
        ));
        let transient = Arc::new(LocalBlobStore::new(
            "tmp",
            ks,
            Arc::new(PathStrategyFlat::new(dir.path().join("transient"))),
        ));
        let tx_store = TransactionalBlobStore::new(store.clone(), transient);
        BlobStoreTests::new(&tx_store).run_all().unwrap();

        let tx = tx_store.begin();
        let key = write(&tx, "doc1", b"hello").unwrap();
        assert_eq!(key, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(read(store.as_ref(), &key), None);
        tx.commit().unwrap();
        assert_eq!(read(store.as_ref(), &key).as_deref(), Some(&b"hello"[..]));
        let leftovers = std::fs::read_dir(dir.path().join("transient"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}
