use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use blobkeep_core::DigestAlgorithm;
use clap::Subcommand;
use toml_edit::{DocumentMut, Item, Table};
use tracing::info;

#[derive(Subcommand)]
pub enum CmdConfig {
    /// Creates the config file if it doesn't exist, with a local default provider
    Init,
    /// Adds a local blob provider, keeping the rest of the file as is
    AddLocal {
        /// Id of the new provider
        id: String,
        /// Root directory of the provider's files
        path: PathBuf,
        /// Digest algorithm of its keys (e.g. "SHA-256")
        #[arg(long)]
        digest: Option<String>,
    },
}

impl CmdConfig {
    pub fn run(self, config_file: PathBuf, local_data_dir: &Path) -> anyhow::Result<()> {
        let mut doc = if config_file.exists() {
            fs::read_to_string(&config_file)?
        } else {
            if let Some(parent) = config_file.parent() {
                fs::create_dir_all(parent)?;
            }
            "".to_owned()
        }
        .parse::<DocumentMut>()
        .context("could not parse config file")?;

        let providers = doc
            .entry("provider")
            .or_insert(Item::Table(Table::new()))
            .as_table_mut()
            .context("`provider` is not a table")?;
        providers.set_implicit(true);

        match self {
            Self::Init => {
                if providers.contains_key("default") {
                    info!("config already has a default provider");
                } else {
                    let path = local_data_dir.join("blobs");
                    providers.insert("default", local_provider(&path, None)?.into());
                }
            }
            Self::AddLocal { id, path, digest } => {
                anyhow::ensure!(
                    !providers.contains_key(&id),
                    "provider {id} already exists in {}",
                    config_file.display()
                );
                providers.insert(&id, local_provider(&path, digest.as_deref())?.into());
            }
        }

        info!("writing to config file {config_file:?}");

        let tmp_path = config_file.with_extension("tmp");
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(doc.to_string().as_bytes())?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, config_file)?;
        Ok(())
    }
}

fn local_provider(path: &Path, digest: Option<&str>) -> anyhow::Result<Table> {
    let path = path
        .to_str()
        .with_context(|| format!("path {} is not valid UTF-8", path.display()))?;
    let mut table = Table::new();
    table.insert("type", "local".into());
    table.insert("path", path.into());
    if let Some(digest) = digest {
        digest
            .parse::<DigestAlgorithm>()
            .with_context(|| format!("invalid digest {digest:?}"))?;
        table.insert("digest", digest.into());
    }
    Ok(table)
}
