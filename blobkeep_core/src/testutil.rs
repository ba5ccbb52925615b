//! Test utilities for `BlobStore` implementations.
//!
//! A conformance suite that can be run against any `BlobStore` to verify
//! the trait contract.
//!
//! # Usage
//!
//! In your store crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! blobkeep_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use blobkeep_core::testutil::BlobStoreTests;
//!
//! #[test]
//! fn test_my_store() {
//!     let store = MyStore::new(...);
//!     BlobStoreTests::new(&store).run_all().unwrap();
//! }
//! ```

use bytes::Bytes;
use rand::Rng;

use crate::{
    blob::{Blob, BlobContext, DocRef, strip_blob_key_version},
    error::BlobResult,
    store::{BlobStore, read_blob_bytes},
};

/// Test suite for `BlobStore` implementations.
pub struct BlobStoreTests<'a> {
    store: &'a dyn BlobStore,
}

impl<'a> BlobStoreTests<'a> {
    pub fn new(store: &'a dyn BlobStore) -> Self {
        Self { store }
    }

    fn doc_id(&self) -> String {
        format!("doc{:08x}", rand::rng().random::<u32>())
    }

    fn write(&self, data: Bytes, doc_id: &str) -> BlobResult<String> {
        self.store.write_blob_context(BlobContext::with_doc(
            Blob::from_bytes(data),
            DocRef::new(doc_id, "content"),
        ))
    }

    fn read(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        read_blob_bytes(self.store, key)
    }

    /// Run all tests.
    pub fn run_all(&self) -> BlobResult<()> {
        self.test_round_trip()?;
        self.test_empty_blob()?;
        if self.store.key_strategy().use_deduplication() {
            self.test_deduplication()?;
        } else {
            self.test_overwrite()?;
        }
        if self.store.has_versioning() {
            self.test_versioning()?;
        }
        self.test_missing()?;
        self.test_read_blob_to_file()?;
        self.test_delete()?;
        self.test_copy()?;
        Ok(())
    }

    /// Bytes written come back unchanged.
    pub fn test_round_trip(&self) -> BlobResult<()> {
        let data = random_bytes(10 * 1024 + 7);
        let key = self.write(data.clone(), &self.doc_id())?;
        let read = self.read(&key)?;
        crate::assert_bytes_eq!(
            read.expect("written blob should be readable"),
            data,
            "round-trip content mismatch"
        );
        Ok(())
    }

    pub fn test_empty_blob(&self) -> BlobResult<()> {
        let key = self.write(Bytes::new(), &self.doc_id())?;
        let read = self.read(&key)?;
        assert_eq!(read.as_deref(), Some(&[][..]), "empty blob should read back empty");
        Ok(())
    }

    /// Identical bytes share one key.
    pub fn test_deduplication(&self) -> BlobResult<()> {
        let data = random_bytes(1000);
        let k1 = self.write(data.clone(), &self.doc_id())?;
        let k2 = self.write(data, &self.doc_id())?;
        if self.store.has_versioning() {
            assert_eq!(strip_blob_key_version(&k1), strip_blob_key_version(&k2));
        } else {
            assert_eq!(k1, k2, "identical content should yield identical keys");
        }
        Ok(())
    }

    /// Rewrites under the same id replace the previous content.
    pub fn test_overwrite(&self) -> BlobResult<()> {
        let id = self.doc_id();
        let k1 = self.write(Bytes::from_static(b"original content"), &id)?;
        let k2 = self.write(Bytes::from_static(b"new content"), &id)?;
        if self.store.has_versioning() {
            assert_ne!(k1, k2);
            assert_eq!(self.read(&k1)?.as_deref(), Some(&b"original content"[..]));
        } else {
            assert_eq!(k1, k2, "same id should yield the same key");
        }
        assert_eq!(self.read(&k2)?.as_deref(), Some(&b"new content"[..]));
        Ok(())
    }

    /// Each versioned write gets its own key and content.
    pub fn test_versioning(&self) -> BlobResult<()> {
        let id = self.doc_id();
        let k1 = self.write(Bytes::from_static(b"v1"), &id)?;
        let k2 = self.write(Bytes::from_static(b"v2"), &id)?;
        assert_ne!(k1, k2, "versioned writes should yield distinct keys");
        assert_eq!(self.read(&k1)?.as_deref(), Some(&b"v1"[..]));
        assert_eq!(self.read(&k2)?.as_deref(), Some(&b"v2"[..]));
        Ok(())
    }

    pub fn test_missing(&self) -> BlobResult<()> {
        let key = format!("{:032x}", rand::rng().random::<u128>());
        assert!(
            !self.store.get_stream(&key)?.is_present(),
            "unknown key should not be present"
        );
        let dir = tempfile::tempdir()?;
        assert!(!self.store.read_blob(&key, &dir.path().join("out"))?);
        Ok(())
    }

    pub fn test_read_blob_to_file(&self) -> BlobResult<()> {
        let data = random_bytes(4096);
        let key = self.write(data.clone(), &self.doc_id())?;
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out");
        assert!(self.store.read_blob(&key, &dest)?);
        crate::assert_bytes_eq!(std::fs::read(&dest)?, data);
        Ok(())
    }

    pub fn test_delete(&self) -> BlobResult<()> {
        let key = self.write(random_bytes(100), &self.doc_id())?;
        assert!(self.read(&key)?.is_some(), "blob should exist before delete");
        self.store.delete_blob(&key);
        assert!(self.read(&key)?.is_none(), "blob should be gone after delete");
        // deleting again is harmless
        self.store.delete_blob(&key);
        Ok(())
    }

    pub fn test_copy(&self) -> BlobResult<()> {
        let data = random_bytes(2048);
        let key = self.write(data.clone(), &self.doc_id())?;
        let target = self.doc_id();
        assert!(self.store.copy_blob(&target, self.store, &key, false)?);
        crate::assert_bytes_eq!(self.read(&target)?.expect("copy should exist"), data);
        assert!(self.read(&key)?.is_some(), "copy should keep the source");

        let missing = format!("{:032x}", rand::rng().random::<u128>());
        assert!(!self.store.copy_blob(&self.doc_id(), self.store, &missing, false)?);
        Ok(())
    }
}

/// Generate random bytes for testing.
pub fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::rng().fill(&mut data[..]);
    Bytes::from(data)
}

/// Assert that two byte slices are equal with a descriptive message.
#[macro_export]
macro_rules! assert_bytes_eq {
    ($left:expr, $right:expr) => {
        assert_eq!(
            AsRef::<[u8]>::as_ref(&$left),
            AsRef::<[u8]>::as_ref(&$right),
            "byte content mismatch"
        );
    };
    ($left:expr, $right:expr, $($arg:tt)+) => {
        assert_eq!(
            AsRef::<[u8]>::as_ref(&$left),
            AsRef::<[u8]>::as_ref(&$right),
            $($arg)+
        );
    };
}
