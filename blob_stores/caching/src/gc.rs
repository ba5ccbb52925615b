use std::sync::Arc;

use blobkeep_core::{
    BlobResult,
    gc::{BinaryGarbageCollector, BinaryManagerStatus},
};

/// Runs several collectors as one, so that a cache forgets what its
/// backing store forgets. Collectors sharing an id run once.
#[derive(Debug)]
pub struct FanOutCollector {
    collectors: Vec<Arc<dyn BinaryGarbageCollector>>,
}

impl FanOutCollector {
    pub fn new(collectors: impl IntoIterator<Item = Arc<dyn BinaryGarbageCollector>>) -> Self {
        let mut unique: Vec<Arc<dyn BinaryGarbageCollector>> = Vec::new();
        for gc in collectors {
            if !unique.iter().any(|u| u.id() == gc.id()) {
                unique.push(gc);
            }
        }
        Self { collectors: unique }
    }

    /// The distinct collectors run by this one.
    pub fn collectors(&self) -> &[Arc<dyn BinaryGarbageCollector>] {
        &self.collectors
    }
}

impl BinaryGarbageCollector for FanOutCollector {
    fn id(&self) -> String {
        let ids: Vec<String> = self.collectors.iter().map(|gc| gc.id()).collect();
        ids.join("+")
    }

    fn start(&self) -> BlobResult<()> {
        for (i, gc) in self.collectors.iter().enumerate() {
            if let Err(e) = gc.start() {
                // leave the ones already started idle again
                for started in &self.collectors[..i] {
                    if let Err(e) = started.stop(false) {
                        tracing::warn!("gc: failed to abort {}: {e}", started.id());
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn mark(&self, key: &str) -> BlobResult<()> {
        for gc in &self.collectors {
            gc.mark(key)?;
        }
        Ok(())
    }

    fn stop(&self, delete: bool) -> BlobResult<BinaryManagerStatus> {
        let mut status = BinaryManagerStatus::default();
        let mut first_err = None;
        for gc in &self.collectors {
            match gc.stop(delete) {
                Ok(s) => {
                    status.merge(&s);
                    status.gc_duration = status.gc_duration.max(s.gc_duration);
                }
                Err(e) => {
                    tracing::warn!("gc: stopping {} failed: {e}", gc.id());
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }

    fn status(&self) -> BinaryManagerStatus {
        let mut status = BinaryManagerStatus::default();
        for gc in &self.collectors {
            let s = gc.status();
            status.merge(&s);
            status.gc_duration = status.gc_duration.max(s.gc_duration);
        }
        status
    }

    fn is_in_progress(&self) -> bool {
        self.collectors.iter().any(|gc| gc.is_in_progress())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobkeep_core::{DigestAlgorithm, KeyStrategyDigest, store::BlobStore};
    use blobkeep_store_memory::InMemoryBlobStore;

    fn collector() -> Arc<dyn BinaryGarbageCollector> {
        InMemoryBlobStore::new("mem", Arc::new(KeyStrategyDigest::new(DigestAlgorithm::Md5)))
            .garbage_collector()
    }

    #[test]
    fn same_collector_runs_once() {
        let gc = collector();
        let fan_out = FanOutCollector::new([gc.clone(), collector(), gc]);
        assert_eq!(fan_out.collectors().len(), 2);
    }

    #[test]
    fn failed_start_leaves_others_idle() {
        let idle = collector();
        let busy = collector();
        busy.start().unwrap();
        let fan_out = FanOutCollector::new([idle.clone(), busy.clone()]);
        assert!(fan_out.start().is_err());
        assert!(!idle.is_in_progress());
        assert!(busy.is_in_progress());
        busy.stop(false).unwrap();
    }
}
