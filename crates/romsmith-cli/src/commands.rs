use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "romsmith")]
#[command(about = "Match ROM files against catalogs and rebuild them", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan inputs, match them against a catalog and write the matches
    Rebuild(RebuildArgs),
    /// Maintain a content-addressed depot
    Depot {
        /// Depot root (overrides depot.root)
        #[arg(long, global = true)]
        depot: Option<PathBuf>,
        #[command(subcommand)]
        command: DepotCommands,
    },
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct RebuildArgs {
    /// Normalized catalog as JSON
    #[arg(short, long)]
    pub catalog: PathBuf,
    /// Files or directories to scan (defaults to root_paths)
    pub inputs: Vec<PathBuf>,
    /// Output root (overrides output_root)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
    /// folder, tar, zip or depot
    #[arg(short, long)]
    pub format: Option<String>,
    /// Write files that match nothing instead of files that match
    #[arg(long)]
    pub inverse: bool,
    /// Match archive members by their recorded CRC32
    #[arg(long)]
    pub quick: bool,
    /// Remove inputs once everything they produced was written
    #[arg(long)]
    pub delete: bool,
    /// Keep catalog timestamps on written files
    #[arg(long)]
    pub preserve_timestamps: bool,
    /// Write a fixdat of unmatched entries into this directory
    #[arg(long)]
    pub fixdat: Option<PathBuf>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub sub_workers: Option<usize>,
    /// Stop at the first failed input
    #[arg(long)]
    pub fail_fast: bool,
    /// Stop dispatching new inputs after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum DepotCommands {
    /// Store files, directories and archives in the depot
    Ingest {
        /// Files or directories to ingest (defaults to root_paths)
        inputs: Vec<PathBuf>,
        /// Skip files the depot already holds
        #[arg(long)]
        only_needed: bool,
        /// Treat a file as present when any one of its hashes is known
        #[arg(long)]
        any_hash: bool,
    },
    /// Resolve a CRC32, MD5 or SHA-1 to stored files
    Lookup { hash: String },
    /// Count rows in the depot index
    Stats,
}
