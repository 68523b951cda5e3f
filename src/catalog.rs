//! Persistent catalog of daily price snapshots.
//!
//! Four tables keyed by (date, chain): stores, products, prices, and the
//! per-date ingestion log. The catalog is a durable cache of the upstream
//! archives, not a system of record: `replace_date` is the only write path
//! and re-ingesting a date atomically replaces everything previously
//! written for it.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, ToSql, Transaction, params};
use tracing::debug;

use crate::dates;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Catalog product matches are capped here before merging.
pub const MATCH_LIMIT: usize = 500;

/// Rows per INSERT statement, kept well under the SQLite parameter limit.
const INSERT_BATCH: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stores (
    chain    TEXT NOT NULL,
    store_id TEXT NOT NULL,
    date     TEXT NOT NULL,
    kind     TEXT NOT NULL DEFAULT '',
    address  TEXT NOT NULL DEFAULT '',
    city     TEXT NOT NULL DEFAULT '',
    zipcode  TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_stores_chain_date ON stores(chain, date);
CREATE INDEX IF NOT EXISTS idx_stores_city ON stores(city);
CREATE UNIQUE INDEX IF NOT EXISTS idx_stores_key ON stores(store_id, chain, date);

CREATE TABLE IF NOT EXISTS products (
    chain      TEXT NOT NULL,
    product_id TEXT NOT NULL,
    date       TEXT NOT NULL,
    barcode    TEXT NOT NULL DEFAULT '',
    name       TEXT NOT NULL DEFAULT '',
    brand      TEXT NOT NULL DEFAULT '',
    category   TEXT NOT NULL DEFAULT '',
    unit       TEXT NOT NULL DEFAULT '',
    quantity   TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_products_chain_date ON products(chain, date);
CREATE INDEX IF NOT EXISTS idx_products_barcode ON products(barcode, date);
CREATE INDEX IF NOT EXISTS idx_products_name ON products(name, date);
CREATE UNIQUE INDEX IF NOT EXISTS idx_products_key ON products(product_id, chain, date);

CREATE TABLE IF NOT EXISTS prices (
    chain         TEXT NOT NULL,
    store_id      TEXT NOT NULL,
    product_id    TEXT NOT NULL,
    date          TEXT NOT NULL,
    price         REAL NOT NULL DEFAULT 0,
    unit_price    REAL,
    best_price_30 REAL,
    anchor_price  REAL,
    special_price REAL
);
CREATE INDEX IF NOT EXISTS idx_prices_chain_date ON prices(chain, date);
CREATE INDEX IF NOT EXISTS idx_prices_product ON prices(product_id, chain, date);
CREATE INDEX IF NOT EXISTS idx_prices_store ON prices(store_id, chain, date);
CREATE UNIQUE INDEX IF NOT EXISTS idx_prices_key ON prices(chain, store_id, product_id, date);

CREATE TABLE IF NOT EXISTS ingestion_log (
    date          TEXT PRIMARY KEY,
    ingested_at   INTEGER NOT NULL,
    store_count   INTEGER NOT NULL DEFAULT 0,
    product_count INTEGER NOT NULL DEFAULT 0,
    price_count   INTEGER NOT NULL DEFAULT 0,
    status        TEXT NOT NULL,
    error_message TEXT
);
";

/// A physical outlet within a chain on a date.
#[derive(Debug, Clone, Default)]
pub struct Store {
    pub chain: String,
    pub store_id: String,
    pub date: String,
    pub kind: String,
    pub address: String,
    pub city: String,
    pub zipcode: String,
}

/// A catalog item offered by a chain on a date.
#[derive(Debug, Clone, Default)]
pub struct Product {
    pub chain: String,
    pub product_id: String,
    pub date: String,
    pub barcode: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub unit: String,
    pub quantity: String,
}

/// One price observation for one product at one store on a date.
#[derive(Debug, Clone, Default)]
pub struct Price {
    pub chain: String,
    pub store_id: String,
    pub product_id: String,
    pub date: String,
    pub price: f64,
    pub unit_price: Option<f64>,
    pub best_price_30: Option<f64>,
    pub anchor_price: Option<f64>,
    pub special_price: Option<f64>,
}

/// One `ingestion_log` row.
#[derive(Debug, Clone)]
pub struct IngestionRecord {
    pub date: String,
    pub ingested_at: i64,
    pub store_count: i64,
    pub product_count: i64,
    pub price_count: i64,
    pub status: String,
    pub error_message: Option<String>,
}

/// Everything ingested for one date.
#[derive(Debug, Default)]
pub struct DateBundle {
    pub stores: Vec<Store>,
    pub products: Vec<Product>,
    pub prices: Vec<Price>,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> rusqlite::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Atomically replace all rows for `date` and record success with the
    /// three counts. A failed insert rolls everything back; the caller then
    /// records the failure via [`record_failure`](Self::record_failure).
    pub fn replace_date(&self, date: &str, bundle: &DateBundle) -> rusqlite::Result<IngestionRecord> {
        let mut conn = self.conn.lock().expect("catalog lock poisoned");
        let tx = conn.transaction()?;

        for table in ["stores", "products", "prices"] {
            tx.execute(&format!("DELETE FROM {table} WHERE date = ?1"), params![date])?;
        }
        insert_stores(&tx, &bundle.stores)?;
        insert_products(&tx, &bundle.products)?;
        insert_prices(&tx, &bundle.prices)?;

        let record = IngestionRecord {
            date: date.to_string(),
            ingested_at: dates::now_epoch(),
            store_count: bundle.stores.len() as i64,
            product_count: bundle.products.len() as i64,
            price_count: bundle.prices.len() as i64,
            status: STATUS_SUCCESS.to_string(),
            error_message: None,
        };
        tx.execute(
            "INSERT OR REPLACE INTO ingestion_log
             (date, ingested_at, store_count, product_count, price_count, status, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            params![
                record.date,
                record.ingested_at,
                record.store_count,
                record.product_count,
                record.price_count,
                record.status,
            ],
        )?;
        tx.commit()?;
        debug!(
            "replaced {date}: {} stores, {} products, {} prices",
            record.store_count, record.product_count, record.price_count
        );
        Ok(record)
    }

    /// Record a failed ingest attempt for `date`.
    pub fn record_failure(&self, date: &str, message: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO ingestion_log
             (date, ingested_at, store_count, product_count, price_count, status, error_message)
             VALUES (?1, ?2, 0, 0, 0, ?3, ?4)",
            params![date, dates::now_epoch(), STATUS_ERROR, message],
        )?;
        Ok(())
    }

    /// True iff `date` has a success row.
    pub fn is_date_ingested(&self, date: &str) -> rusqlite::Result<bool> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM ingestion_log WHERE date = ?1 AND status = ?2")?;
        stmt.exists(params![date, STATUS_SUCCESS])
    }

    /// Newest date with a success row.
    pub fn latest_ingested_date(&self) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        conn.query_row(
            "SELECT MAX(date) FROM ingestion_log WHERE status = ?1",
            params![STATUS_SUCCESS],
            |row| row.get(0),
        )
    }

    /// Most recent success dates, newest first.
    pub fn recent_success_dates(&self, limit: usize) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT date FROM ingestion_log WHERE status = ?1 ORDER BY date DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![STATUS_SUCCESS, limit as i64], |row| row.get(0))?;
        rows.collect()
    }

    /// The log row for `date`, if any attempt was recorded.
    pub fn ingestion(&self, date: &str) -> rusqlite::Result<Option<IngestionRecord>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT date, ingested_at, store_count, product_count, price_count, status, error_message
             FROM ingestion_log WHERE date = ?1",
        )?;
        let mut rows = stmt.query_map(params![date], ingestion_from_row)?;
        rows.next().transpose()
    }

    /// Recent log rows, newest first, for the operator status view.
    pub fn recent_ingestions(&self, limit: usize) -> rusqlite::Result<Vec<IngestionRecord>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT date, ingested_at, store_count, product_count, price_count, status, error_message
             FROM ingestion_log ORDER BY date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], ingestion_from_row)?;
        rows.collect()
    }

    /// Products on `date` whose name or brand contains `q`, or whose
    /// barcode equals `q`. Capped at [`MATCH_LIMIT`].
    ///
    /// `q` must already be lowercased. The substring comparison runs in
    /// Rust, not in SQL: SQLite's `LIKE` folds only ASCII case and would
    /// miss č/ć/đ/š/ž.
    pub fn products_matching(&self, date: &str, q: &str) -> rusqlite::Result<Vec<Product>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare_cached(
            "SELECT chain, product_id, date, barcode, name, brand, category, unit, quantity
             FROM products WHERE date = ?1",
        )?;
        let rows = stmt.query_map(params![date], product_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            let product = row?;
            if product.barcode == q
                || product.name.to_lowercase().contains(q)
                || product.brand.to_lowercase().contains(q)
            {
                out.push(product);
                if out.len() >= MATCH_LIMIT {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Products on `date` matched the way price history matches: exact
    /// barcode when given, otherwise name substring; chain exact if given.
    /// `name` must already be lowercased; the substring comparison runs in
    /// Rust for the same reason as in [`products_matching`](Self::products_matching).
    pub fn products_for_history(
        &self,
        date: &str,
        barcode: Option<&str>,
        name: Option<&str>,
        chain: Option<&str>,
    ) -> rusqlite::Result<Vec<Product>> {
        let mut sql = String::from(
            "SELECT chain, product_id, date, barcode, name, brand, category, unit, quantity
             FROM products WHERE date = ?1",
        );
        let mut args: Vec<&dyn ToSql> = vec![&date];
        if let Some(barcode) = barcode.as_ref() {
            sql.push_str(&format!(" AND barcode = ?{}", args.len() + 1));
            args.push(barcode);
        }
        if let Some(chain) = chain.as_ref() {
            sql.push_str(&format!(" AND chain = ?{}", args.len() + 1));
            args.push(chain);
        }

        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), product_from_row)?;
        let mut products: Vec<Product> = rows.collect::<rusqlite::Result<_>>()?;
        if barcode.is_none()
            && let Some(name) = name
        {
            products.retain(|p| p.name.to_lowercase().contains(name));
        }
        Ok(products)
    }

    /// Stores on `date` for the given chains, optionally narrowed to cities
    /// containing `city` (substring, case-insensitive with diacritics
    /// folded in Rust).
    pub fn stores_for_chains(
        &self,
        date: &str,
        chains: &[String],
        city: Option<&str>,
    ) -> rusqlite::Result<Vec<Store>> {
        if chains.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT chain, store_id, date, kind, address, city, zipcode
             FROM stores WHERE date = ?1 AND chain IN ({})",
            placeholders(chains.len(), 2)
        );
        let mut args: Vec<&dyn ToSql> = vec![&date];
        args.extend(chains.iter().map(|c| c as &dyn ToSql));

        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), store_from_row)?;
        let mut stores: Vec<Store> = rows.collect::<rusqlite::Result<_>>()?;
        if let Some(city) = city {
            let city = city.to_lowercase();
            stores.retain(|s| s.city.to_lowercase().contains(&city));
        }
        Ok(stores)
    }

    /// Prices on `date` restricted to the given chains and product ids.
    pub fn prices_for(
        &self,
        date: &str,
        chains: &[String],
        product_ids: &[String],
    ) -> rusqlite::Result<Vec<Price>> {
        if chains.is_empty() || product_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT chain, store_id, product_id, date, price,
                    unit_price, best_price_30, anchor_price, special_price
             FROM prices WHERE date = ?1 AND chain IN ({}) AND product_id IN ({})",
            placeholders(chains.len(), 2),
            placeholders(product_ids.len(), 2 + chains.len()),
        );
        let mut args: Vec<&dyn ToSql> = vec![&date];
        args.extend(chains.iter().map(|c| c as &dyn ToSql));
        args.extend(product_ids.iter().map(|p| p as &dyn ToSql));

        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), price_from_row)?;
        rows.collect()
    }

    /// Distinct non-empty store cities across all ingested dates.
    pub fn cities(&self) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn.lock().expect("catalog lock poisoned");
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT city FROM stores WHERE city <> ''")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }
}

fn placeholders(count: usize, first: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", first + i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_stores(tx: &Transaction<'_>, rows: &[Store]) -> rusqlite::Result<()> {
    for chunk in rows.chunks(INSERT_BATCH) {
        let sql = format!(
            "INSERT OR REPLACE INTO stores (chain, store_id, date, kind, address, city, zipcode)
             VALUES {}",
            vec!["(?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ")
        );
        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 7);
        for s in chunk {
            args.extend([
                &s.chain as &dyn ToSql,
                &s.store_id,
                &s.date,
                &s.kind,
                &s.address,
                &s.city,
                &s.zipcode,
            ]);
        }
        tx.execute(&sql, args.as_slice())?;
    }
    Ok(())
}

fn insert_products(tx: &Transaction<'_>, rows: &[Product]) -> rusqlite::Result<()> {
    for chunk in rows.chunks(INSERT_BATCH) {
        let sql = format!(
            "INSERT OR REPLACE INTO products
             (chain, product_id, date, barcode, name, brand, category, unit, quantity)
             VALUES {}",
            vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ")
        );
        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 9);
        for p in chunk {
            args.extend([
                &p.chain as &dyn ToSql,
                &p.product_id,
                &p.date,
                &p.barcode,
                &p.name,
                &p.brand,
                &p.category,
                &p.unit,
                &p.quantity,
            ]);
        }
        tx.execute(&sql, args.as_slice())?;
    }
    Ok(())
}

fn insert_prices(tx: &Transaction<'_>, rows: &[Price]) -> rusqlite::Result<()> {
    for chunk in rows.chunks(INSERT_BATCH) {
        let sql = format!(
            "INSERT OR REPLACE INTO prices
             (chain, store_id, product_id, date, price,
              unit_price, best_price_30, anchor_price, special_price)
             VALUES {}",
            vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ")
        );
        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 9);
        for p in chunk {
            args.extend([
                &p.chain as &dyn ToSql,
                &p.store_id,
                &p.product_id,
                &p.date,
                &p.price,
                &p.unit_price,
                &p.best_price_30,
                &p.anchor_price,
                &p.special_price,
            ]);
        }
        tx.execute(&sql, args.as_slice())?;
    }
    Ok(())
}

fn store_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Store> {
    Ok(Store {
        chain: row.get(0)?,
        store_id: row.get(1)?,
        date: row.get(2)?,
        kind: row.get(3)?,
        address: row.get(4)?,
        city: row.get(5)?,
        zipcode: row.get(6)?,
    })
}

fn product_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        chain: row.get(0)?,
        product_id: row.get(1)?,
        date: row.get(2)?,
        barcode: row.get(3)?,
        name: row.get(4)?,
        brand: row.get(5)?,
        category: row.get(6)?,
        unit: row.get(7)?,
        quantity: row.get(8)?,
    })
}

fn price_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Price> {
    Ok(Price {
        chain: row.get(0)?,
        store_id: row.get(1)?,
        product_id: row.get(2)?,
        date: row.get(3)?,
        price: row.get(4)?,
        unit_price: row.get(5)?,
        best_price_30: row.get(6)?,
        anchor_price: row.get(7)?,
        special_price: row.get(8)?,
    })
}

fn ingestion_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestionRecord> {
    Ok(IngestionRecord {
        date: row.get(0)?,
        ingested_at: row.get(1)?,
        store_count: row.get(2)?,
        product_count: row.get(3)?,
        price_count: row.get(4)?,
        status: row.get(5)?,
        error_message: row.get(6)?,
    })
}
