use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::PROVIDER_SEP;
use crate::error::{BlobError, BlobResult};

/// Durable description of a stored blob, as persisted by its owning document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl BlobInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Handle on a blob stored by a provider.
///
/// The key is always fully qualified: the provider id is everything before
/// the first colon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBlob {
    provider_id: String,
    info: BlobInfo,
}

impl ManagedBlob {
    /// Builds a handle from a record whose key carries its provider prefix.
    pub fn new(info: BlobInfo) -> BlobResult<Self> {
        let pos = info.key.find(PROVIDER_SEP).ok_or_else(|| {
            BlobError::InvalidKey(format!("key has no provider prefix: {}", info.key))
        })?;
        Ok(Self {
            provider_id: info.key[..pos].to_owned(),
            info,
        })
    }

    /// Builds a handle from an unprefixed store key.
    pub fn with_provider(provider_id: &str, mut info: BlobInfo) -> Self {
        info.key = format!("{provider_id}{PROVIDER_SEP}{}", info.key);
        Self {
            provider_id: provider_id.to_owned(),
            info,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Full `"<providerId>:<storeKey>"` key.
    pub fn key(&self) -> &str {
        &self.info.key
    }

    /// Key as understood by the provider's store.
    pub fn store_key(&self) -> &str {
        &self.info.key[self.provider_id.len() + 1..]
    }

    pub fn info(&self) -> &BlobInfo {
        &self.info
    }

    pub fn into_info(self) -> BlobInfo {
        self.info
    }
}

/// Availability of a blob, mostly relevant to cold storage tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStatus {
    pub storage_class: Option<String>,
    pub downloadable: bool,
    pub downloadable_until: Option<SystemTime>,
    pub ongoing_restore: bool,
}

impl Default for BlobStatus {
    fn default() -> Self {
        Self {
            storage_class: None,
            downloadable: true,
            downloadable_until: None,
            ongoing_restore: false,
        }
    }
}

impl BlobStatus {
    pub fn with_storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn with_downloadable(mut self, downloadable: bool) -> Self {
        self.downloadable = downloadable;
        self
    }

    pub fn with_downloadable_until(mut self, until: SystemTime) -> Self {
        self.downloadable_until = Some(until);
        self
    }

    pub fn with_ongoing_restore(mut self, ongoing_restore: bool) -> Self {
        self.ongoing_restore = ongoing_restore;
        self
    }
}

/// Out-of-band property changes on an existing blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUpdateContext {
    pub key: String,
    /// `Some(None)` clears the retention date.
    pub update_retain_until: Option<Option<SystemTime>>,
    pub update_legal_hold: Option<bool>,
}

impl BlobUpdateContext {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            update_retain_until: None,
            update_legal_hold: None,
        }
    }

    pub fn with_update_retain_until(mut self, retain_until: Option<SystemTime>) -> Self {
        self.update_retain_until = Some(retain_until);
        self
    }

    pub fn with_update_legal_hold(mut self, hold: bool) -> Self {
        self.update_legal_hold = Some(hold);
        self
    }

    /// Same updates, addressed to another key.
    pub fn for_key(&self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_blob_requires_prefix() {
        let err = ManagedBlob::new(BlobInfo::new("abc")).unwrap_err();
        assert!(matches!(err, BlobError::InvalidKey(_)));

        let blob = ManagedBlob::new(BlobInfo::new("default:abc:def")).unwrap();
        assert_eq!(blob.provider_id(), "default");
        assert_eq!(blob.store_key(), "abc:def");
        assert_eq!(blob.key(), "default:abc:def");
    }

    #[test]
    fn managed_blob_with_provider() {
        let blob = ManagedBlob::with_provider("p1", BlobInfo::new("k@v"));
        assert_eq!(blob.key(), "p1:k@v");
        assert_eq!(blob.store_key(), "k@v");
    }

    #[test]
    fn blob_info_copy_is_independent() {
        let mut info = BlobInfo::new("k");
        info.mime_type = Some("text/plain".into());
        let mut copy = info.clone();
        copy.mime_type = None;
        assert_eq!(info.mime_type.as_deref(), Some("text/plain"));
    }
}
