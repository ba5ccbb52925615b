use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::helpers::load_manager;

mod blobs;

pub use blobs::run_blobs;

pub fn run_command(config_file: PathBuf, local_data_dir: &Path, cmd: crate::Commands) -> Result<()> {
    match cmd {
        crate::Commands::Config { cmd } => cmd.run(config_file, local_data_dir),
        cmd => {
            let manager = load_manager(&config_file)?;
            let result = run_blobs(cmd, &manager);
            manager.close();
            result
        }
    }
}
