use anyhow::{Context, Result, bail};
use blobkeep_core::{Blob, BlobContent, BlobInfo};
use blobkeep_provider::BlobManager;

use crate::Commands;
use crate::helpers::{read_keep_file, store_key_for};

pub fn run_blobs(cmd: Commands, manager: &BlobManager) -> Result<()> {
    match cmd {
        Commands::Put { provider, path } => {
            anyhow::ensure!(path.is_file(), "{} is not a file", path.display());
            let mut blob = Blob::from_file(&path);
            if let Some(name) = path.file_name() {
                blob = blob.with_filename(name.to_string_lossy());
            }
            let key = manager
                .write_blob(&provider, blob, None)
                .with_context(|| format!("failed to store {}", path.display()))?;
            println!("{key}");
        }
        Commands::Get { key, out } => {
            let blob = manager
                .read_blob(&BlobInfo::new(&key))
                .with_context(|| format!("failed to read blob {key}"))?;
            let written = match &blob.content {
                BlobContent::File(path) => std::fs::copy(path, &out),
                BlobContent::Bytes(bytes) => std::fs::write(&out, bytes).map(|()| bytes.len() as u64),
            }
            .with_context(|| format!("failed to write to {}", out.display()))?;
            println!("wrote {written} bytes to {}", out.display());
        }
        Commands::Delete { key } => {
            manager
                .delete_blob(&key)
                .with_context(|| format!("failed to delete blob {key}"))?;
            println!("deleted {key}");
        }
        Commands::Gc {
            provider,
            keep_file,
            dry_run,
        } => {
            let keys = match &keep_file {
                Some(path) => read_keep_file(path)?,
                None => Vec::new(),
            };
            let gc = manager.get_blob_provider(&provider)?.garbage_collector();
            gc.start()?;
            for key in &keys {
                let Some(store_key) = store_key_for(&provider, key) else {
                    tracing::debug!("skipping {key}, not a key of {provider}");
                    continue;
                };
                if let Err(e) = gc.mark(store_key) {
                    if let Err(stop_err) = gc.stop(false) {
                        tracing::warn!("failed to abort gc of {provider}: {stop_err}");
                    }
                    return Err(e).with_context(|| format!("failed to mark {key}"));
                }
            }
            let status = gc.stop(!dry_run)?;
            let verb = if dry_run { "would delete" } else { "deleted" };
            println!(
                "kept {} blobs ({} bytes), {verb} {} blobs ({} bytes) in {:?}",
                status.num_binaries,
                status.size_binaries,
                status.num_binaries_gc,
                status.size_binaries_gc,
                status.gc_duration
            );
        }
        Commands::CacheClear { provider } => {
            let Some(report) = manager.get_blob_provider(&provider)?.clear_cache()? else {
                bail!("provider {provider} has no cache");
            };
            println!(
                "kept {} files ({} bytes), deleted {} files ({} bytes)",
                report.kept_count, report.kept_size, report.deleted_count, report.deleted_size
            );
        }
        Commands::Config { .. } => unreachable!(),
    }
    Ok(())
}
