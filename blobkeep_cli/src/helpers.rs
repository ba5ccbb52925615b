use anyhow::{Context, Result};
use blobkeep_provider::{BlobManager, ManagerConfig};
use std::path::Path;

pub fn load_manager(config_file: &Path) -> Result<BlobManager> {
    let toml_content = std::fs::read_to_string(config_file).with_context(|| {
        format!(
            "failed to read config {} (run `blobkeep config init` first)",
            config_file.display()
        )
    })?;
    let config = ManagerConfig::from_toml(&toml_content)
        .with_context(|| format!("invalid config {}", config_file.display()))?;
    Ok(BlobManager::from_config(&config)?)
}

/// Keys listed one per line; blank lines and `#` comments are skipped.
pub fn read_keep_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read keep file {}", path.display()))?;
    Ok(parse_keys(&content))
}

fn parse_keys(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Store key of `key` within provider `provider_id`, or `None` if the key
/// belongs to another provider. Unprefixed keys are taken as store keys.
pub fn store_key_for<'a>(provider_id: &str, key: &'a str) -> Option<&'a str> {
    match key.split_once(':') {
        Some((id, rest)) if id == provider_id => Some(rest),
        Some(_) => None,
        None => Some(key),
    }
}
