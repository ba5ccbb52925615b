use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use super::{Blob, BlobContent, DocRef};
use crate::{
    digest::{DigestAlgorithm, Digester},
    error::{BlobError, BlobResult},
};

/// A blob about to be written, with the document it belongs to.
#[derive(Debug, Clone)]
pub struct BlobContext {
    pub blob: Blob,
    pub doc: Option<DocRef>,
}

impl BlobContext {
    pub fn new(blob: Blob) -> Self {
        Self { blob, doc: None }
    }

    pub fn with_doc(blob: Blob, doc: DocRef) -> Self {
        Self {
            blob,
            doc: Some(doc),
        }
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.doc.as_ref().and_then(|d| d.doc_id.as_deref())
    }

    pub fn xpath(&self) -> Option<&str> {
        self.doc.as_ref().and_then(|d| d.xpath.as_deref())
    }
}

#[derive(Debug)]
enum KeyComputer {
    Fixed(String),
    /// Key is the digest of the bytes, known once they went through a transfer.
    Digest {
        digester: Option<Digester>,
        digest: Option<String>,
    },
}

/// Write-time view of a [`BlobContext`], produced by a key strategy.
#[derive(Debug)]
pub struct BlobWriteContext {
    pub blob_context: BlobContext,
    key: KeyComputer,
    use_deduplication: bool,
    file: Option<PathBuf>,
}

impl BlobWriteContext {
    /// Context whose key is known upfront.
    pub fn with_key(blob_context: BlobContext, key: impl Into<String>, dedup: bool) -> Self {
        Self {
            blob_context,
            key: KeyComputer::Fixed(key.into()),
            use_deduplication: dedup,
            file: None,
        }
    }

    /// Context whose key is the digest of the bytes as they are written.
    pub fn with_digest(blob_context: BlobContext, algorithm: DigestAlgorithm) -> Self {
        Self {
            blob_context,
            key: KeyComputer::Digest {
                digester: Some(Digester::new(algorithm)),
                digest: None,
            },
            use_deduplication: true,
            file: None,
        }
    }

    /// Context for raw bytes already on disk, stored under a fixed key.
    pub fn for_file(file: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        let file = file.into();
        let mut ctx = Self::with_key(
            BlobContext::new(Blob::from_file(file.clone())),
            key,
            false,
        );
        ctx.file = Some(file);
        ctx
    }

    pub fn use_deduplication(&self) -> bool {
        self.use_deduplication
    }

    /// Local file holding the bytes, once a transfer produced one.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Records that the bytes are now available at `path`.
    pub fn set_file(&mut self, path: impl Into<PathBuf>) {
        self.file = Some(path.into());
    }

    /// The storage key. For digest keys this is only available after a transfer.
    pub fn key(&self) -> BlobResult<String> {
        match &self.key {
            KeyComputer::Fixed(key) => Ok(key.clone()),
            KeyComputer::Digest {
                digest: Some(digest),
                ..
            } => Ok(digest.clone()),
            KeyComputer::Digest { digest: None, .. } => Err(BlobError::illegal_state(
                "digest key requested before the blob was transferred",
            )),
        }
    }

    /// True if the key can be read without transferring the bytes first.
    pub fn key_is_known(&self) -> bool {
        !matches!(self.key, KeyComputer::Digest { digest: None, .. })
    }

    /// Streams the blob bytes to `out`, running them through the digest
    /// observer on the first pass. Returns the number of bytes written.
    pub fn transfer(&mut self, out: &mut dyn Write) -> BlobResult<u64> {
        let digester = match &mut self.key {
            KeyComputer::Digest { digester, .. } => digester.as_mut(),
            KeyComputer::Fixed(_) => None,
        };
        let mut observed = ObservedWriter { out, digester };
        let written = match (&self.file, &self.blob_context.blob.content) {
            (Some(path), _) | (None, BlobContent::File(path)) => {
                let mut file = File::open(path)?;
                io::copy(&mut file, &mut observed)?
            }
            (None, BlobContent::Bytes(bytes)) => {
                observed.write_all(bytes)?;
                bytes.len() as u64
            }
        };
        observed.flush()?;
        if let KeyComputer::Digest { digester, digest } = &mut self.key
            && let Some(d) = digester.take()
        {
            *digest = Some(d.finish_hex());
        }
        Ok(written)
    }

    /// Transfers the bytes into a new file at `dest` and records it as the
    /// backing file of this context.
    pub fn transfer_to(&mut self, dest: &Path) -> BlobResult<u64> {
        let mut file = File::create(dest)?;
        let written = self.transfer(&mut file)?;
        file.sync_all()?;
        self.file = Some(dest.to_path_buf());
        Ok(written)
    }
}

struct ObservedWriter<'a> {
    out: &'a mut dyn Write,
    digester: Option<&'a mut Digester>,
}

impl Write for ObservedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        if let Some(d) = self.digester.as_mut() {
            d.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_key_is_computed_by_transfer() {
        let ctx = BlobContext::new(Blob::from_bytes(&b"hello"[..]));
        let mut wctx = BlobWriteContext::with_digest(ctx, DigestAlgorithm::Md5);
        assert!(!wctx.key_is_known());
        assert!(wctx.key().is_err());

        let mut out = Vec::new();
        assert_eq!(wctx.transfer(&mut out).unwrap(), 5);
        assert_eq!(out, b"hello");
        assert_eq!(wctx.key().unwrap(), "5d41402abc4b2a76b9719d911017c592");

        // a second transfer keeps the key
        let mut again = Vec::new();
        wctx.transfer(&mut again).unwrap();
        assert_eq!(again, b"hello");
        assert_eq!(wctx.key().unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn transfer_to_records_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let ctx = BlobContext::new(Blob::from_bytes(&b"abc"[..]));
        let mut wctx = BlobWriteContext::with_key(ctx, "k", false);
        wctx.transfer_to(&dest).unwrap();
        assert_eq!(wctx.file(), Some(dest.as_path()));
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
        assert_eq!(wctx.key().unwrap(), "k");
    }
}
