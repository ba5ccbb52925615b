//! Core blobkeep types and traits.
//!
//! This crate defines what every blob store and the provider layer share:
//!
//! - the blob data model (`blob::Blob`, `blob::BlobInfo`, `blob::ManagedBlob`, ...)
//! - content digests (`digest::DigestAlgorithm`)
//! - key derivation (`key::KeyStrategy`) and key to path mapping
//!   (`paths::PathStrategy`)
//! - the storage abstraction (`store::BlobStore`) and its garbage collection
//!   framework (`gc::BinaryGarbageCollector`)
//!
//! Concrete stores live in the `blob_stores/` crates.

pub mod blob;
pub mod digest;
pub mod empty;
pub mod error;
pub mod gc;
pub mod key;
pub mod optional;
pub mod paths;
pub mod store;

// Test utilities (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

pub use blob::{
    Blob, BlobContent, BlobContext, BlobInfo, BlobStatus, BlobUpdateContext, BlobWriteContext,
    DocRef, ManagedBlob,
};
pub use digest::{DigestAlgorithm, DigestConfiguration};
pub use empty::EmptyBlobStore;
pub use error::{BlobError, BlobResult};
pub use gc::{BinaryGarbageCollector, BinaryManagerStatus, MarkSweepCollector, NoopCollector};
pub use key::{KeyStrategy, KeyStrategyDigest, KeyStrategyDocId, KeyStrategyManaged};
pub use optional::OptionalOrUnknown;
pub use paths::{PathStrategy, PathStrategyFlat, PathStrategyShortened, PathStrategySubDirs};
pub use store::{BlobReader, BlobStore};
