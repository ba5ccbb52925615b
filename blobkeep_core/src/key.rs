//! How storage keys are derived from blob content.

use std::{any::Any, fmt::Debug, sync::Arc};

use crate::{
    blob::{BlobContext, BlobWriteContext, strip_blob_key_prefix, strip_blob_key_version},
    digest::{DigestAlgorithm, DigestConfiguration},
    error::{BlobError, BlobResult},
};

/// Decides how the key of a blob is computed.
pub trait KeyStrategy: Debug + Send + Sync + 'static {
    /// True if byte-identical blobs share a single key.
    fn use_deduplication(&self) -> bool;

    /// Digest of the content if it can be read off the key.
    fn digest_from_key(&self, key: &str) -> Option<String>;

    /// Prepares the write of a blob, possibly deferring key computation
    /// until its bytes have been transferred.
    fn blob_write_context(&self, blob_context: BlobContext) -> BlobResult<BlobWriteContext>;

    /// True if both strategies produce the same key for the same blob.
    fn same_as(&self, other: &dyn KeyStrategy) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Keys are the hex digest of the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStrategyDigest {
    pub config: DigestConfiguration,
}

impl KeyStrategyDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            config: DigestConfiguration::new(algorithm),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.config.algorithm
    }
}

impl KeyStrategy for KeyStrategyDigest {
    fn use_deduplication(&self) -> bool {
        true
    }

    fn digest_from_key(&self, key: &str) -> Option<String> {
        self.config.is_valid_digest(key).then(|| key.to_owned())
    }

    fn blob_write_context(&self, blob_context: BlobContext) -> BlobResult<BlobWriteContext> {
        Ok(BlobWriteContext::with_digest(
            blob_context,
            self.config.algorithm,
        ))
    }

    fn same_as(&self, other: &dyn KeyStrategy) -> bool {
        other
            .as_any()
            .downcast_ref::<KeyStrategyDigest>()
            .is_some_and(|o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Keys are the id of the owning document; rewrites overwrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStrategyDocId;

impl KeyStrategy for KeyStrategyDocId {
    fn use_deduplication(&self) -> bool {
        false
    }

    fn digest_from_key(&self, _key: &str) -> Option<String> {
        None
    }

    fn blob_write_context(&self, blob_context: BlobContext) -> BlobResult<BlobWriteContext> {
        let key = match blob_context.doc_id() {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => return Err(BlobError::InvalidKey("missing id".into())),
        };
        Ok(BlobWriteContext::with_key(blob_context, key, false))
    }

    fn same_as(&self, other: &dyn KeyStrategy) -> bool {
        other.as_any().is::<KeyStrategyDocId>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reuses the key of a blob that is already stored instead of recomputing it.
#[derive(Debug, Clone)]
pub struct KeyStrategyManaged {
    inner: Arc<dyn KeyStrategy>,
}

impl KeyStrategyManaged {
    pub fn new(inner: Arc<dyn KeyStrategy>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn KeyStrategy> {
        &self.inner
    }
}

impl KeyStrategy for KeyStrategyManaged {
    fn use_deduplication(&self) -> bool {
        self.inner.use_deduplication()
    }

    fn digest_from_key(&self, key: &str) -> Option<String> {
        self.inner.digest_from_key(key)
    }

    fn blob_write_context(&self, blob_context: BlobContext) -> BlobResult<BlobWriteContext> {
        let reused = blob_context
            .blob
            .managed
            .as_ref()
            .map(|m| strip_blob_key_version(strip_blob_key_prefix(m.key())).to_owned());
        match reused {
            Some(key) => Ok(BlobWriteContext::with_key(
                blob_context,
                key,
                self.inner.use_deduplication(),
            )),
            None => self.inner.blob_write_context(blob_context),
        }
    }

    fn same_as(&self, other: &dyn KeyStrategy) -> bool {
        match other.as_any().downcast_ref::<KeyStrategyManaged>() {
            Some(o) => self.inner.same_as(o.inner.as_ref()),
            None => self.inner.same_as(other),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{Blob, BlobInfo, DocRef, ManagedBlob};

    fn transfer_key(mut ctx: BlobWriteContext) -> String {
        let mut sink = Vec::new();
        ctx.transfer(&mut sink).unwrap();
        ctx.key().unwrap()
    }

    #[test]
    fn digest_strategy() {
        let ks = KeyStrategyDigest::new(DigestAlgorithm::Sha256);
        assert!(ks.use_deduplication());
        let ctx = ks
            .blob_write_context(BlobContext::new(Blob::from_bytes(&b"hello"[..])))
            .unwrap();
        let key = transfer_key(ctx);
        assert_eq!(
            key,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(ks.digest_from_key(&key), Some(key.clone()));
        assert_eq!(ks.digest_from_key("not-a-digest"), None);
    }

    #[test]
    fn doc_id_strategy() {
        let ks = KeyStrategyDocId;
        assert!(!ks.use_deduplication());
        let ctx = ks
            .blob_write_context(BlobContext::with_doc(
                Blob::from_bytes(&b"x"[..]),
                DocRef::new("doc-1", "content"),
            ))
            .unwrap();
        assert_eq!(ctx.key().unwrap(), "doc-1");

        let err = ks
            .blob_write_context(BlobContext::new(Blob::from_bytes(&b"x"[..])))
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidKey(_)));
    }

    #[test]
    fn managed_strategy_reuses_key() {
        let ks = KeyStrategyManaged::new(Arc::new(KeyStrategyDigest::new(DigestAlgorithm::Md5)));
        let managed = ManagedBlob::new(BlobInfo::new("src:abcdef@v3")).unwrap();
        let blob = Blob::from_bytes(&b"whatever"[..]).with_managed(managed);
        let ctx = ks.blob_write_context(BlobContext::new(blob)).unwrap();
        assert!(ctx.key_is_known());
        assert_eq!(ctx.key().unwrap(), "abcdef");
        assert!(ctx.use_deduplication());

        // fresh bytes go through the wrapped strategy
        let ctx = ks
            .blob_write_context(BlobContext::new(Blob::from_bytes(&b"hello"[..])))
            .unwrap();
        assert_eq!(transfer_key(ctx), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn strategy_equality() {
        let md5 = KeyStrategyDigest::new(DigestAlgorithm::Md5);
        let sha = KeyStrategyDigest::new(DigestAlgorithm::Sha256);
        assert!(md5.same_as(&KeyStrategyDigest::new(DigestAlgorithm::Md5)));
        assert!(!md5.same_as(&sha));
        assert!(!md5.same_as(&KeyStrategyDocId));
        let managed = KeyStrategyManaged::new(Arc::new(md5));
        assert!(managed.same_as(&md5));
    }
}
