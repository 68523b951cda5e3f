//! Batch ingest of one archive-day into the catalog.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::archive::{ArchiveClient, PRICES_CSV, PRODUCTS_CSV, RemoteArchive, STORES_CSV};
use crate::catalog::{Catalog, DateBundle, Price, Product, Store};
use crate::table::{self, Record};
use crate::IngestArgs;
use crate::dates;

/// At most this many chain tasks in flight; keeps upstream load predictable.
const CHAIN_CONCURRENCY: usize = 5;

/// Result of one ingest invocation.
#[derive(Debug)]
pub struct IngestOutcome {
    pub date: String,
    pub skipped: bool,
    pub store_count: i64,
    pub product_count: i64,
    pub price_count: i64,
}

/// CLI entry point: resolve the date, serialize against concurrent runs,
/// and run [`ingest`].
pub async fn execute(catalog: &Catalog, archive: &ArchiveClient, args: &IngestArgs) -> Result<()> {
    // Concurrent ingests of the same date must serialize; an exclusive file
    // lock is the single-writer guard across processes.
    let _lock_guard = match args.lock_file.as_ref() {
        Some(path) => Some(acquire_lock(path)?),
        None => None,
    };

    let date = match args.date.clone() {
        Some(date) => {
            anyhow::ensure!(dates::is_valid(&date), "invalid --date (expected YYYY-MM-DD)");
            date
        }
        None => match archive.list().await {
            Ok(archives) => archives
                .first()
                .map(|a| a.date.clone())
                .unwrap_or_else(dates::today),
            Err(e) => {
                warn!("archive list unavailable ({e}); falling back to today");
                dates::today()
            }
        },
    };

    let outcome = ingest(catalog, archive, &date, args.force).await?;
    if outcome.skipped {
        info!("{} already ingested; nothing to do", outcome.date);
    } else {
        info!(
            "ingested {}: {} stores, {} products, {} prices",
            outcome.date, outcome.store_count, outcome.product_count, outcome.price_count
        );
    }
    Ok(())
}

/// Load one archive-day into the catalog.
///
/// A success row for `date` short-circuits unless `force`. Individual chain
/// failures are logged and swallowed; failures of the size probe or the
/// directory fetch abort the whole ingest and are recorded as an error row.
pub async fn ingest(
    catalog: &Catalog,
    archive: &ArchiveClient,
    date: &str,
    force: bool,
) -> Result<IngestOutcome> {
    if !force && catalog.is_date_ingested(date)? {
        return Ok(IngestOutcome {
            date: date.to_string(),
            skipped: true,
            store_count: 0,
            product_count: 0,
            price_count: 0,
        });
    }

    let remote = match archive.open(date).await {
        Ok(remote) => Arc::new(remote),
        Err(e) => {
            catalog.record_failure(date, &e.to_string())?;
            return Err(e).with_context(|| format!("open archive for {date}"));
        }
    };

    let chains = remote.chains();
    info!("ingesting {date}: {} chains", chains.len());

    let sem = Arc::new(Semaphore::new(CHAIN_CONCURRENCY));
    let mut tasks = Vec::with_capacity(chains.len());
    for chain in chains {
        let permit = sem.clone().acquire_owned().await.expect("semaphore open");
        let remote = Arc::clone(&remote);
        let date = date.to_string();
        tasks.push(tokio::spawn(async move {
            let _p = permit;
            (chain.clone(), read_chain(&remote, &chain, &date).await)
        }));
    }

    let mut bundle = DateBundle::default();
    for task in tasks {
        let (chain, result) = task.await.context("chain task panicked")?;
        match result {
            Ok(part) => {
                info!(
                    "{chain}: {} stores, {} products, {} prices",
                    part.stores.len(),
                    part.products.len(),
                    part.prices.len()
                );
                bundle.stores.extend(part.stores);
                bundle.products.extend(part.products);
                bundle.prices.extend(part.prices);
            }
            Err(e) => error!("{chain}: skipped ({e})"),
        }
    }

    let record = match catalog.replace_date(date, &bundle) {
        Ok(record) => record,
        Err(e) => {
            catalog.record_failure(date, &e.to_string())?;
            return Err(e).with_context(|| format!("replace catalog rows for {date}"));
        }
    };

    Ok(IngestOutcome {
        date: record.date,
        skipped: false,
        store_count: record.store_count,
        product_count: record.product_count,
        price_count: record.price_count,
    })
}

/// Read and map one chain's three CSV members.
async fn read_chain(
    remote: &RemoteArchive,
    chain: &str,
    date: &str,
) -> crate::error::Result<DateBundle> {
    let stores_text = remote.read_csv(chain, STORES_CSV).await?;
    let products_text = remote.read_csv(chain, PRODUCTS_CSV).await?;
    let prices_text = remote.read_csv(chain, PRICES_CSV).await?;
    Ok(map_chain(chain, date, &stores_text, &products_text, &prices_text))
}

/// Decode and type one chain's CSVs. The `chain` and `date` fields are
/// stamped from context, never read from the rows.
pub fn map_chain(
    chain: &str,
    date: &str,
    stores_text: &str,
    products_text: &str,
    prices_text: &str,
) -> DateBundle {
    DateBundle {
        stores: table::parse(stores_text)
            .iter()
            .map(|rec| store_from(rec, chain, date))
            .collect(),
        products: table::parse(products_text)
            .iter()
            .map(|rec| product_from(rec, chain, date))
            .collect(),
        prices: table::parse(prices_text)
            .iter()
            .map(|rec| price_from(rec, chain, date))
            .collect(),
    }
}

fn field(rec: &Record, key: &str) -> String {
    rec.get(key).cloned().unwrap_or_default()
}

fn store_from(rec: &Record, chain: &str, date: &str) -> Store {
    Store {
        chain: chain.to_string(),
        store_id: field(rec, "store_id"),
        date: date.to_string(),
        kind: field(rec, "type"),
        address: field(rec, "address"),
        city: field(rec, "city"),
        zipcode: field(rec, "zipcode"),
    }
}

fn product_from(rec: &Record, chain: &str, date: &str) -> Product {
    Product {
        chain: chain.to_string(),
        product_id: field(rec, "product_id"),
        date: date.to_string(),
        barcode: field(rec, "barcode"),
        name: field(rec, "name"),
        brand: field(rec, "brand"),
        category: field(rec, "category"),
        unit: field(rec, "unit"),
        quantity: field(rec, "quantity"),
    }
}

fn price_from(rec: &Record, chain: &str, date: &str) -> Price {
    Price {
        chain: chain.to_string(),
        store_id: field(rec, "store_id"),
        product_id: field(rec, "product_id"),
        date: date.to_string(),
        price: table::parse_price(&field(rec, "price")),
        unit_price: table::parse_opt_price(&field(rec, "unit_price")),
        best_price_30: table::parse_opt_price(&field(rec, "best_price_30")),
        anchor_price: table::parse_opt_price(&field(rec, "anchor_price")),
        special_price: table::parse_opt_price(&field(rec, "special_price")),
    }
}

/// Acquire an exclusive file lock; keep the file handle alive to hold it.
pub fn acquire_lock(lock_path: &Path) -> Result<std::fs::File> {
    fs::create_dir_all(lock_path.parent().unwrap_or(Path::new("."))).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.lock_exclusive()?;
    Ok(file)
}
