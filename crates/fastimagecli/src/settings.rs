use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Fetches images into virtual slots and maintains the image cache.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Overrides the cache directory of the configuration.
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch URLs into a number of slots, printing every status change.
    ///
    /// Slots are reused like the rows of a scrolling list: once a slot has shown its image, it
    /// is bound to the next URL.
    Fetch {
        /// The URLs or file paths to fetch.
        #[arg(required = true)]
        urls: Vec<String>,

        /// The number of slots.
        #[arg(long, short, default_value_t = 4)]
        slots: usize,

        /// Print download progress.
        #[arg(long)]
        progress: bool,

        /// Pretend there is no network connection.
        #[arg(long)]
        offline: bool,
    },

    /// Remove every cached image whose URL starts with a prefix.
    Invalidate { prefix: String },

    /// Remove all cached images.
    Clear,

    /// Print the file an URL is cached in.
    Path { url: String },

    /// Remove expired images from the cache directory.
    Cleanup,
}
