use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::client::DEFAULT_MAX_TRANSFERS;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Receive trees into a directory
    Serve {
        /// Directory to sync into
        path: PathBuf,
        /// Port to listen on
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Sync a file or directory tree to a server
    Push {
        /// File or directory to send
        path: PathBuf,
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Skip entries whose path below the source matches this glob
        #[arg(long = "exclude", value_name = "GLOB")]
        excludes: Vec<String>,
        /// Upper bound on simultaneous transfer connections
        #[arg(long, default_value_t = DEFAULT_MAX_TRANSFERS)]
        max_transfers: usize,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}
