use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use blobkeep_core::{BlobError, BlobResult, DigestAlgorithm};
use blobkeep_store_caching::CacheConfig;
use blobkeep_store_local::Encryption;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DIGEST: DigestAlgorithm = DigestAlgorithm::Md5;

/// Contents of a blobkeep config file: one table per provider id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    #[serde(default)]
    pub provider: BTreeMap<String, BlobProviderConfig>,
}

impl ManagerConfig {
    pub fn from_toml(s: &str) -> BlobResult<Self> {
        let config: ManagerConfig =
            toml::from_str(s).map_err(|e| BlobError::config(e.to_string()))?;
        for (id, provider) in &config.provider {
            provider
                .validate()
                .map_err(|e| BlobError::config(format!("provider {id}: {e}")))?;
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> BlobResult<String> {
        toml::to_string_pretty(self).map_err(|e| BlobError::config(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategyKind {
    #[default]
    Digest,
    DocId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BlobProviderConfig {
    /// Name of the store factory, `local`, `memory` or `cache_only` unless
    /// more were registered.
    #[serde(rename = "type")]
    pub kind: String,
    pub path: Option<PathBuf>,
    pub digest: Option<String>,
    pub key_strategy: Option<KeyStrategyKind>,
    /// Lets several logical stores share one physical root.
    pub namespace: Option<String>,
    pub transactional: bool,
    pub transient: bool,
    pub record: bool,
    pub allow_byte_range: bool,
    pub prevent_user_update: bool,
    pub create_from_key_users: Option<String>,
    pub create_from_key_groups: Option<String>,
    pub subdirs_depth: Option<usize>,
    pub cache: Option<CacheSection>,
    pub encryption: Option<EncryptionConfig>,
}

impl Default for BlobProviderConfig {
    fn default() -> Self {
        Self {
            kind: "local".into(),
            path: None,
            digest: None,
            key_strategy: None,
            namespace: None,
            transactional: false,
            transient: false,
            record: false,
            allow_byte_range: false,
            prevent_user_update: false,
            create_from_key_users: None,
            create_from_key_groups: None,
            subdirs_depth: None,
            cache: None,
            encryption: None,
        }
    }
}

impl BlobProviderConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Checks what can be checked without touching the filesystem. Factories
    /// check the rest.
    pub fn validate(&self) -> BlobResult<()> {
        if self.kind.is_empty() {
            return Err(BlobError::config("missing provider type"));
        }
        self.digest_algorithm()?;
        if self.record && self.key_strategy == Some(KeyStrategyKind::Digest) {
            return Err(BlobError::config(
                "record providers key blobs by document id",
            ));
        }
        if let Some(ns) = &self.namespace
            && (ns.is_empty() || ns.contains(['/', '\\']) || ns == "." || ns == "..")
        {
            return Err(BlobError::config(format!("invalid namespace {ns:?}")));
        }
        if self.subdirs_depth == Some(0) {
            return Err(BlobError::config("subdirs_depth must be at least 1"));
        }
        if let Some(encryption) = &self.encryption {
            encryption.validate()?;
        }
        Ok(())
    }

    pub fn digest_algorithm(&self) -> BlobResult<DigestAlgorithm> {
        match &self.digest {
            Some(name) => name.parse(),
            None => Ok(DEFAULT_DIGEST),
        }
    }

    /// Record providers always key by document id.
    pub fn key_strategy_kind(&self) -> KeyStrategyKind {
        if self.record {
            KeyStrategyKind::DocId
        } else {
            self.key_strategy.unwrap_or_default()
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional || self.record
    }

    /// `<path>` or `<path>_<namespace>`.
    pub fn root_dir(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        Some(match &self.namespace {
            Some(ns) => {
                let mut name = path.as_os_str().to_owned();
                name.push("_");
                name.push(ns);
                PathBuf::from(name)
            }
            None => path.clone(),
        })
    }

    pub fn cache_config(&self) -> Option<CacheConfig> {
        self.cache.as_ref().map(CacheSection::to_cache_config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    pub dir: PathBuf,
    pub max_size: Option<u64>,
    pub max_count: Option<u64>,
    pub min_age_secs: Option<u64>,
    pub clear_interval_secs: Option<u64>,
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::new(&self.dir);
        if let Some(max_size) = self.max_size {
            config.max_size = max_size;
        }
        if let Some(max_count) = self.max_count {
            config.max_count = max_count;
        }
        if let Some(secs) = self.min_age_secs {
            config.min_age = Duration::from_secs(secs);
        }
        if let Some(secs) = self.clear_interval_secs {
            config.clear_interval = Duration::from_secs(secs);
        }
        config
    }
}

/// Either a password, or a key held in a keystore. Never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionConfig {
    pub password: Option<String>,
    pub keystore_type: Option<String>,
    pub keystore_file: Option<PathBuf>,
    pub keystore_password: Option<String>,
    pub key_alias: Option<String>,
    pub key_password: Option<String>,
}

impl EncryptionConfig {
    fn uses_keystore(&self) -> bool {
        self.keystore_type.is_some()
            || self.keystore_file.is_some()
            || self.keystore_password.is_some()
            || self.key_alias.is_some()
            || self.key_password.is_some()
    }

    pub fn validate(&self) -> BlobResult<()> {
        match (&self.password, self.uses_keystore()) {
            (Some(_), true) => Err(BlobError::config(
                "encryption password cannot be combined with keystore properties",
            )),
            (Some(password), false) if password.is_empty() => {
                Err(BlobError::config("empty encryption password"))
            }
            (Some(_), false) => Ok(()),
            (None, true) => {
                let missing: Vec<&str> = [
                    ("keystore_type", self.keystore_type.is_none()),
                    ("keystore_file", self.keystore_file.is_none()),
                    ("key_alias", self.key_alias.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, missing)| missing.then_some(name))
                .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(BlobError::config(format!(
                        "keystore encryption requires {}",
                        missing.join(", ")
                    )))
                }
            }
            (None, false) => Err(BlobError::config(
                "encryption requires a password or a keystore",
            )),
        }
    }

    pub fn to_encryption(&self) -> BlobResult<Encryption> {
        self.validate()?;
        if let Some(password) = &self.password {
            return Encryption::from_password(password);
        }
        match (&self.keystore_type, &self.keystore_file, &self.key_alias) {
            (Some(kind), Some(file), Some(alias)) => Encryption::from_keystore(kind, file, alias),
            _ => Err(BlobError::config("incomplete keystore configuration")),
        }
    }
}
