use std::path::PathBuf;

use anyhow::Result;
use cjenik::archive::{ArchiveClient, DEFAULT_BASE_URL, mk_client};
use cjenik::catalog::Catalog;
use cjenik::query::HistoryQuery;
use cjenik::{IngestArgs, dates, ingest, query};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// SQLite catalog path (or set CJENIK_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Upstream base URL (or set CJENIK_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ingest(IngestArgs),
    /// Search products by name, brand, or exact barcode
    Search {
        /// Search text
        #[arg(long)]
        query: String,
        /// Snapshot date, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
        /// Keep only prices from stores in cities containing this text
        #[arg(long)]
        city: Option<String>,
    },
    /// Price history for one product over the last N days
    History {
        /// Exact barcode; wins over --name when both are given
        #[arg(long)]
        barcode: Option<String>,
        /// Product name substring
        #[arg(long)]
        name: Option<String>,
        /// Keep only prices from stores in cities containing this text
        #[arg(long)]
        city: Option<String>,
        /// Restrict to one chain code
        #[arg(long)]
        chain: Option<String>,
        /// Number of most recent days to aggregate
        #[arg(long, default_value = "7")]
        days: usize,
    },
    /// List known store cities
    Cities,
    /// List archives published by the upstream
    Archives,
    /// Show recent ingestion log rows
    Status {
        /// Number of log rows to show
        #[arg(long, default_value = "14")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();

    let db_path = args
        .db
        .clone()
        .or_else(|| std::env::var("CJENIK_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./cjenik.db"));
    let base_url = args
        .base_url
        .clone()
        .or_else(|| std::env::var("CJENIK_BASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

    let catalog = Catalog::open(&db_path)?;
    let archive = ArchiveClient::new(mk_client()?, base_url);

    match args.command {
        Command::Ingest(ingest_args) => {
            ingest::execute(&catalog, &archive, &ingest_args).await?;
        }
        Command::Search { query: q, date, city } => {
            let date = date.unwrap_or_else(dates::today);
            let result = query::search(&catalog, &archive, &date, &q, city.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::History {
            barcode,
            name,
            city,
            chain,
            days,
        } => {
            let history = query::history(
                &catalog,
                &archive,
                &HistoryQuery {
                    barcode,
                    name,
                    city,
                    chain,
                    days,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Command::Cities => {
            for city in query::cities(&catalog, &archive).await? {
                println!("{city}");
            }
        }
        Command::Archives => {
            for info in archive.list().await?.iter() {
                println!(
                    "{}  {:>12} bytes  {}",
                    info.date,
                    info.size,
                    info.updated.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Status { limit } => {
            for row in catalog.recent_ingestions(limit)? {
                match row.status.as_str() {
                    "success" => println!(
                        "{}  success  {} stores, {} products, {} prices",
                        row.date, row.store_count, row.product_count, row.price_count
                    ),
                    _ => println!(
                        "{}  error    {}",
                        row.date,
                        row.error_message.as_deref().unwrap_or("unknown")
                    ),
                }
            }
        }
    }
    Ok(())
}
