pub mod archive;
pub mod catalog;
pub mod dates;
pub mod error;
pub mod ingest;
pub mod query;
pub mod table;
pub mod zip;

use clap::Parser;
use std::path::PathBuf;

/// CLI args for the ingest driver
#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Load one archive-day of price snapshots into the catalog")]
pub struct IngestArgs {
    /// Archive date (YYYY-MM-DD); defaults to the most recent published
    /// archive, or today if the upstream list is unavailable
    #[arg(long)]
    pub date: Option<String>,

    /// Re-ingest even if the date already has a success row
    #[arg(long)]
    pub force: bool,

    /// Optional lock file path to prevent concurrent ingest runs
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}
