//! Mark-and-sweep garbage collection of stored blobs.
//!
//! A run goes `start` → `mark(key)`* → `stop(delete)`. Everything not marked
//! during the run is garbage; with `delete = false` it is only counted.

use std::{
    collections::HashSet,
    fmt::Debug,
    sync::Mutex,
    time::{Duration, Instant, SystemTime},
};

use crate::error::{BlobError, BlobResult};

/// Outcome of a collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryManagerStatus {
    /// Blobs kept.
    pub num_binaries: u64,
    pub size_binaries: u64,
    /// Blobs collected, or that would have been with `delete = false`.
    pub num_binaries_gc: u64,
    pub size_binaries_gc: u64,
    pub gc_duration: Duration,
}

impl BinaryManagerStatus {
    pub fn keep(&mut self, size: u64) {
        self.num_binaries += 1;
        self.size_binaries += size;
    }

    pub fn collect(&mut self, size: u64) {
        self.num_binaries_gc += 1;
        self.size_binaries_gc += size;
    }

    /// Adds the counts of `other`; durations are not summed.
    pub fn merge(&mut self, other: &BinaryManagerStatus) {
        self.num_binaries += other.num_binaries;
        self.size_binaries += other.size_binaries;
        self.num_binaries_gc += other.num_binaries_gc;
        self.size_binaries_gc += other.size_binaries_gc;
    }
}

pub trait BinaryGarbageCollector: Debug + Send + Sync + 'static {
    /// Identifies the storage the collector works on, so that collectors
    /// shared by several stores run only once.
    fn id(&self) -> String;

    fn start(&self) -> BlobResult<()>;

    /// Marks `key` as still referenced.
    fn mark(&self, key: &str) -> BlobResult<()>;

    fn stop(&self, delete: bool) -> BlobResult<BinaryManagerStatus>;

    /// Status of the last completed run.
    fn status(&self) -> BinaryManagerStatus;

    fn is_in_progress(&self) -> bool;
}

/// State of an ongoing run.
#[derive(Debug)]
pub struct GcRun {
    pub start_time: SystemTime,
    pub marked: HashSet<String>,
    started: Instant,
}

/// The storage-specific half of a [`MarkSweepCollector`].
pub trait SweepBackend: Debug + Send + Sync + 'static {
    fn id(&self) -> String;

    fn mark(&self, key: &str, run: &mut GcRun) -> BlobResult<()> {
        run.marked.insert(key.to_owned());
        Ok(())
    }

    /// Counts every blob as kept or collected into `status`, deleting the
    /// collected ones if `delete`.
    fn sweep(&self, run: &GcRun, status: &mut BinaryManagerStatus, delete: bool) -> BlobResult<()>;
}

/// Collector enforcing the start/mark/stop state machine around a backend.
#[derive(Debug)]
pub struct MarkSweepCollector<B> {
    backend: B,
    run: Mutex<Option<GcRun>>,
    status: Mutex<BinaryManagerStatus>,
}

impl<B: SweepBackend> MarkSweepCollector<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            run: Mutex::new(None),
            status: Mutex::new(BinaryManagerStatus::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<GcRun>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<B: SweepBackend> BinaryGarbageCollector for MarkSweepCollector<B> {
    fn id(&self) -> String {
        self.backend.id()
    }

    fn start(&self) -> BlobResult<()> {
        let mut run = self.lock_run();
        if run.is_some() {
            return Err(BlobError::illegal_state(format!(
                "garbage collection already in progress for {}",
                self.backend.id()
            )));
        }
        *run = Some(GcRun {
            start_time: SystemTime::now(),
            marked: HashSet::new(),
            started: Instant::now(),
        });
        tracing::debug!("gc started for {}", self.backend.id());
        Ok(())
    }

    fn mark(&self, key: &str) -> BlobResult<()> {
        let mut run = self.lock_run();
        let Some(run) = run.as_mut() else {
            return Err(BlobError::illegal_state(format!(
                "garbage collection not started for {}",
                self.backend.id()
            )));
        };
        self.backend.mark(key, run)
    }

    fn stop(&self, delete: bool) -> BlobResult<BinaryManagerStatus> {
        let run = self.lock_run().take().ok_or_else(|| {
            BlobError::illegal_state(format!(
                "garbage collection not started for {}",
                self.backend.id()
            ))
        })?;
        let mut status = BinaryManagerStatus::default();
        self.backend.sweep(&run, &mut status, delete)?;
        status.gc_duration = run.started.elapsed();
        tracing::info!(
            "gc of {} done in {:?}: kept {} ({} bytes), {} {} ({} bytes)",
            self.backend.id(),
            status.gc_duration,
            status.num_binaries,
            status.size_binaries,
            if delete { "deleted" } else { "would delete" },
            status.num_binaries_gc,
            status.size_binaries_gc,
        );
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status.clone();
        Ok(status)
    }

    fn status(&self) -> BinaryManagerStatus {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_in_progress(&self) -> bool {
        self.lock_run().is_some()
    }
}

/// Collector for stores that hold nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopCollector {
    id: String,
}

impl NoopCollector {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl BinaryGarbageCollector for NoopCollector {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn start(&self) -> BlobResult<()> {
        Ok(())
    }

    fn mark(&self, _key: &str) -> BlobResult<()> {
        Ok(())
    }

    fn stop(&self, _delete: bool) -> BlobResult<BinaryManagerStatus> {
        Ok(BinaryManagerStatus::default())
    }

    fn status(&self) -> BinaryManagerStatus {
        BinaryManagerStatus::default()
    }

    fn is_in_progress(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    struct MapBackend {
        blobs: Mutex<BTreeMap<String, u64>>,
    }

    impl SweepBackend for MapBackend {
        fn id(&self) -> String {
            "map".into()
        }

        fn sweep(
            &self,
            run: &GcRun,
            status: &mut BinaryManagerStatus,
            delete: bool,
        ) -> BlobResult<()> {
            let mut blobs = self.blobs.lock().unwrap();
            blobs.retain(|key, size| {
                if run.marked.contains(key) {
                    status.keep(*size);
                    true
                } else {
                    status.collect(*size);
                    !delete
                }
            });
            Ok(())
        }
    }

    fn collector() -> MarkSweepCollector<MapBackend> {
        let backend = MapBackend::default();
        {
            let mut blobs = backend.blobs.lock().unwrap();
            blobs.insert("a".into(), 1);
            blobs.insert("b".into(), 10);
            blobs.insert("c".into(), 100);
        }
        MarkSweepCollector::new(backend)
    }

    #[test]
    fn state_machine_is_enforced() {
        let gc = collector();
        assert!(matches!(gc.mark("a"), Err(BlobError::IllegalState(_))));
        assert!(matches!(gc.stop(true), Err(BlobError::IllegalState(_))));
        gc.start().unwrap();
        assert!(gc.is_in_progress());
        assert!(matches!(gc.start(), Err(BlobError::IllegalState(_))));
        gc.stop(false).unwrap();
        assert!(!gc.is_in_progress());
    }

    #[test]
    fn dry_run_counts_without_deleting() {
        let gc = collector();
        gc.start().unwrap();
        gc.mark("a").unwrap();
        let status = gc.stop(false).unwrap();
        assert_eq!(status.num_binaries, 1);
        assert_eq!(status.size_binaries, 1);
        assert_eq!(status.num_binaries_gc, 2);
        assert_eq!(status.size_binaries_gc, 110);
        assert_eq!(gc.backend().blobs.lock().unwrap().len(), 3);
        assert_eq!(gc.status(), status);
    }

    #[test]
    fn sweep_deletes_unmarked() {
        let gc = collector();
        gc.start().unwrap();
        gc.mark("b").unwrap();
        gc.mark("c").unwrap();
        let status = gc.stop(true).unwrap();
        assert_eq!(status.num_binaries_gc, 1);
        let blobs = gc.backend().blobs.lock().unwrap();
        assert_eq!(blobs.keys().collect::<Vec<_>>(), ["b", "c"]);
    }
}
