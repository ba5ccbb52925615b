//! Blob values, durable blob records and the contexts passed to stores.

pub mod context;
pub mod info;

use bytes::Bytes;
use std::path::PathBuf;

pub use context::{BlobContext, BlobWriteContext};
pub use info::{BlobInfo, BlobStatus, BlobUpdateContext, ManagedBlob};

/// Separator between a base key and its version token in versioned stores.
pub const VER_SEP: char = '@';

/// Separator between the provider id and the store key in a stored key.
pub const PROVIDER_SEP: char = ':';

/// Removes a leading `"<providerId>:"` if present.
pub fn strip_blob_key_prefix(key: &str) -> &str {
    match key.find(PROVIDER_SEP) {
        Some(pos) => &key[pos + 1..],
        None => key,
    }
}

/// Removes a trailing `"@<version>"` if present.
pub fn strip_blob_key_version(key: &str) -> &str {
    match key.find(VER_SEP) {
        Some(pos) => &key[..pos],
        None => key,
    }
}

/// Splits a store key into its base key and optional version token.
pub fn split_blob_key_version(key: &str) -> (&str, Option<&str>) {
    match key.find(VER_SEP) {
        Some(pos) => (&key[..pos], Some(&key[pos + 1..])),
        None => (key, None),
    }
}

/// Where the bytes of a [`Blob`] live before they reach a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobContent {
    Bytes(Bytes),
    File(PathBuf),
}

/// Reference to the document that owns a blob property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocRef {
    pub repository: Option<String>,
    pub doc_id: Option<String>,
    /// Property path of the blob within the document, `content` for the main blob.
    pub xpath: Option<String>,
}

impl DocRef {
    pub fn new(doc_id: impl Into<String>, xpath: impl Into<String>) -> Self {
        Self {
            repository: None,
            doc_id: Some(doc_id.into()),
            xpath: Some(xpath.into()),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }
}

/// Binary content plus its descriptive metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content: BlobContent,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub encoding: Option<String>,
    pub digest: Option<String>,
    /// Set when these bytes are those of an already stored blob.
    pub managed: Option<ManagedBlob>,
}

impl Blob {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(BlobContent::Bytes(bytes.into()))
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::new(BlobContent::File(path.into()))
    }

    fn new(content: BlobContent) -> Self {
        Self {
            content,
            filename: None,
            mime_type: None,
            encoding: None,
            digest: None,
            managed: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn with_managed(mut self, managed: ManagedBlob) -> Self {
        self.managed = Some(managed);
        self
    }

    /// Length of the content in bytes.
    pub fn length(&self) -> std::io::Result<u64> {
        match &self.content {
            BlobContent::Bytes(b) => Ok(b.len() as u64),
            BlobContent::File(path) => Ok(std::fs::metadata(path)?.len()),
        }
    }

    /// Reads the whole content into memory.
    pub fn to_bytes(&self) -> std::io::Result<Bytes> {
        match &self.content {
            BlobContent::Bytes(b) => Ok(b.clone()),
            BlobContent::File(path) => Ok(Bytes::from(std::fs::read(path)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_and_version_helpers() {
        assert_eq!(strip_blob_key_prefix("default:abc@v1"), "abc@v1");
        assert_eq!(strip_blob_key_prefix("abc"), "abc");
        assert_eq!(strip_blob_key_version("abc@v1"), "abc");
        assert_eq!(strip_blob_key_version("abc"), "abc");
        assert_eq!(split_blob_key_version("abc@v1"), ("abc", Some("v1")));
        assert_eq!(split_blob_key_version("abc"), ("abc", None));
    }

    #[test]
    fn blob_length_from_bytes_and_file() {
        let blob = Blob::from_bytes(&b"hello"[..]).with_filename("hello.txt");
        assert_eq!(blob.length().unwrap(), 5);
        assert_eq!(blob.filename.as_deref(), Some("hello.txt"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();
        let blob = Blob::from_file(&path);
        assert_eq!(blob.length().unwrap(), 10);
        assert_eq!(blob.to_bytes().unwrap().as_ref(), b"0123456789");
    }
}
