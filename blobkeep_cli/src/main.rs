use crate::init_config::CmdConfig;
use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;
use std::path::PathBuf;

mod cmd;
mod helpers;
mod init_config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the blobkeep config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Store a local file and print its key
    Put {
        /// Id of the blob provider in the config (e.g. "default")
        #[arg(short, long, value_name = "ID", default_value = "default")]
        provider: String,
        /// Local file path to store
        path: PathBuf,
    },
    /// Write the bytes of a stored blob into a local file
    Get {
        /// Key as printed by `put`, including the provider prefix
        key: String,
        /// Output file path to write the blob to
        #[arg(long)]
        out: PathBuf,
    },
    /// Delete a stored blob
    Delete {
        /// Key as printed by `put`, including the provider prefix
        key: String,
    },
    /// Collect the blobs of a provider that are not listed as live
    Gc {
        /// Id of the blob provider in the config (e.g. "default")
        #[arg(short, long, value_name = "ID", default_value = "default")]
        provider: String,
        /// File listing the keys still in use, one per line
        #[arg(long, value_name = "FILE")]
        keep_file: Option<PathBuf>,
        /// If set, only report what would be deleted.
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Evict old entries from the cache of a provider now
    CacheClear {
        /// Id of the blob provider in the config (e.g. "default")
        #[arg(short, long, value_name = "ID", default_value = "default")]
        provider: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        // stdout carries command output such as keys
        .with_writer(std::io::stderr)
        .init();

    // - Config under: ~/.config/blobkeep/config.toml
    // - Data under:   ~/.local/share/blobkeep/
    let dirs = ProjectDirs::from("", "", "blobkeep")
        .context("failed to determine config directory path")?;

    let config_file = cli
        .config
        .unwrap_or_else(|| dirs.config_dir().join("config.toml"));

    cmd::run_command(config_file, dirs.data_dir(), cli.cmd)
}
