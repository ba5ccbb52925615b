//! Blob providers: named, configured store stacks, and the registry that
//! resolves a stored key back to the provider that wrote it.

pub mod config;
pub mod manager;
pub mod provider;

pub use config::{BlobProviderConfig, CacheSection, EncryptionConfig, KeyStrategyKind, ManagerConfig};
pub use manager::{BlobManager, DEFAULT_PROVIDER, FactoryContext, StoreFactory};
pub use provider::{BlobProvider, MAIN_BLOB_XPATH, StoreParts};
