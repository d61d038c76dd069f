use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Offline maintenance of simplefs disk images.
#[derive(Parser)]
#[command(name = "sfsctl", version)]
pub struct Cli {
    /// Disk image to operate on
    #[arg(long, short)]
    pub image: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a fresh, empty volume, replacing the image contents
    Format {
        /// Volume size in 4 KiB blocks
        #[arg(long, short, default_value_t = 1024)]
        blocks: u32,
    },
    /// Show block usage
    Info,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Create a directory
    Mkdir { path: String },
    /// Create an empty file if it does not exist yet
    Touch { path: String },
    /// Move a file or directory into another directory, keeping its name
    Mv { src: String, dst_dir: String },
    /// Remove a file
    Rm {
        path: String,

        /// Remove directories and their contents
        #[arg(long, short)]
        recursive: bool,
    },
}
