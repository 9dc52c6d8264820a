use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gridstore")]
#[command(about = "Store and fetch chunked files in a document database", long_about = None)]
pub struct Cli {
    /// Bucket to use, overriding GRIDSTORE_BUCKET
    #[arg(short, long)]
    pub bucket: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the bucket's collections and indexes
    Init,
    /// Store a local file
    Put {
        file_path: PathBuf,
        /// Stored filename, defaults to the local file name
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        alias: Vec<String>,
    },
    /// Fetch the first file matching all given criteria
    Get {
        #[arg(long)]
        id: Option<Uuid>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        md5: Option<String>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List stored files
    Ls {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        md5: Option<String>,
        /// Print each file record as one JSON line
        #[arg(long)]
        json: bool,
    },
    /// Show a file's chunks
    Chunks {
        file_id: Uuid,
        #[arg(long, default_value = "0")]
        skip: u64,
        /// 0 shows all
        #[arg(long, default_value = "0")]
        limit: u64,
    },
    /// Delete a file and its chunks
    Rm {
        file_id: Uuid,
    },
}

pub mod commands;
