use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "rouillesync", about = "An FTP and SFTP client written in Rust.")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable verbose mode
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List a remote directory, e.g. `ls sftp://bob@example.org/home/bob`
    Ls {
        url: String,
        /// Ignore a cached listing
        #[arg(long)]
        refresh: bool,
    },
    /// Download a remote file
    Get {
        url: String,
        /// Local target, defaults to the remote file name
        local: Option<PathBuf>,
        /// Continue a partial download instead of overwriting it
        #[arg(long)]
        resume: bool,
    },
}
