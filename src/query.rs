//! Product search and price-history aggregation.
//!
//! Both entry points answer from the catalog when the requested date is
//! ingested and fall back to on-demand range extraction from the remote
//! archive otherwise. The remote search is two-phase: products first across
//! every chain, then stores and prices only for the chains that matched.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use itertools::Itertools;
use serde::Serialize;
use statrs::statistics::Statistics;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::archive::{ArchiveClient, PRICES_CSV, PRODUCTS_CSV, RemoteArchive, STORES_CSV};
use crate::catalog::{Catalog, Price, Product, Store};
use crate::error::{Error, Result};
use crate::ingest::map_chain;

/// Merged result groups are capped here.
const GROUP_LIMIT: usize = 50;
/// In-flight member fetches per remote-search phase.
const FETCH_CONCURRENCY: usize = 8;
/// Dates aggregated in parallel on the remote history path.
const HISTORY_DATE_BATCH: usize = 5;

/// Major cities served as a floor when the catalog has no stores yet.
const MAJOR_CITIES: [&str; 10] = [
    "Zagreb",
    "Split",
    "Rijeka",
    "Osijek",
    "Zadar",
    "Pula",
    "Slavonski Brod",
    "Karlovac",
    "Varaždin",
    "Dubrovnik",
];

/// Where a result was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Db,
    Zip,
}

/// One price observation attached to a merged product group.
#[derive(Debug, Clone, Serialize)]
pub struct StorePrice {
    pub chain: String,
    pub store_id: String,
    pub city: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_price_30: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_price: Option<f64>,
}

/// Products sharing a barcode (or a single chain-local product when the
/// barcode is empty) with every price observed at a matching store.
#[derive(Debug, Serialize)]
pub struct ProductGroup {
    pub barcode: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub unit: String,
    pub quantity: String,
    pub chains: Vec<String>,
    pub prices: Vec<StorePrice>,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub products: Vec<ProductGroup>,
    pub actual_date: String,
    pub source: Source,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub barcode: Option<String>,
    pub name: Option<String>,
    pub city: Option<String>,
    pub chain: Option<String>,
    pub days: usize,
}

#[derive(Debug, Serialize)]
pub struct ChainStat {
    pub chain: String,
    pub min_price: f64,
    pub avg_price: f64,
}

#[derive(Debug, Serialize)]
pub struct HistoryDay {
    pub date: String,
    pub prices: Vec<ChainStat>,
}

/// Search products by name/brand substring or exact barcode.
///
/// Resolution order: the requested date if ingested, else the latest
/// ingested date, else the remote archive. An empty or whitespace-only
/// query returns an empty result without touching the catalog or the
/// upstream.
pub async fn search(
    catalog: &Catalog,
    archive: &ArchiveClient,
    date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<SearchResult> {
    let q = q.trim().to_lowercase();
    if q.is_empty() {
        return Ok(SearchResult {
            products: Vec::new(),
            actual_date: date.to_string(),
            source: Source::Db,
        });
    }

    if catalog.is_date_ingested(date)? {
        return search_catalog(catalog, date, &q, city);
    }
    if let Some(latest) = catalog.latest_ingested_date()? {
        return search_catalog(catalog, &latest, &q, city);
    }
    search_remote(archive, date, &q, city).await
}

fn search_catalog(
    catalog: &Catalog,
    actual_date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<SearchResult> {
    let products = catalog.products_matching(actual_date, q)?;
    let chains: Vec<String> = products.iter().map(|p| p.chain.clone()).unique().collect();
    let ids: Vec<String> = products
        .iter()
        .map(|p| p.product_id.clone())
        .unique()
        .collect();
    let stores = catalog.stores_for_chains(actual_date, &chains, city)?;
    let prices = catalog.prices_for(actual_date, &chains, &ids)?;

    Ok(SearchResult {
        products: merge_groups(products, &stores, prices),
        actual_date: actual_date.to_string(),
        source: Source::Db,
    })
}

async fn search_remote(
    archive: &ArchiveClient,
    date: &str,
    q: &str,
    city: Option<&str>,
) -> Result<SearchResult> {
    let actual_date = archive.resolve_date(date).await?;
    let remote = Arc::new(archive.open(&actual_date).await?);
    let (products, stores, prices) =
        fetch_remote_rows(&remote, &actual_date, Matcher::Query(q.to_string()), None, city).await;

    Ok(SearchResult {
        products: merge_groups(products, &stores, prices),
        actual_date,
        source: Source::Zip,
    })
}

/// How remote products are selected.
#[derive(Clone)]
enum Matcher {
    /// Name or brand substring, or exact barcode (search).
    Query(String),
    /// Exact barcode (history).
    Barcode(String),
    /// Name substring (history).
    Name(String),
}

impl Matcher {
    fn matches(&self, p: &Product) -> bool {
        match self {
            Matcher::Query(q) => {
                p.name.to_lowercase().contains(q)
                    || p.brand.to_lowercase().contains(q)
                    || p.barcode == *q
            }
            Matcher::Barcode(b) => p.barcode == *b,
            Matcher::Name(n) => p.name.to_lowercase().contains(n),
        }
    }
}

fn city_matches(store_city: &str, city: Option<&str>) -> bool {
    match city {
        Some(city) => store_city.to_lowercase().contains(&city.to_lowercase()),
        None => true,
    }
}

/// Two-phase extraction from an opened archive: `products.csv` from every
/// chain first, then `stores.csv` + `prices.csv` only for chains with at
/// least one match. Per-chain failures are logged and swallowed; partial
/// results stay observable through the result's `source`.
async fn fetch_remote_rows(
    remote: &Arc<RemoteArchive>,
    date: &str,
    matcher: Matcher,
    chain: Option<&str>,
    city: Option<&str>,
) -> (Vec<Product>, Vec<Store>, Vec<Price>) {
    let chains: Vec<String> = remote
        .chains()
        .into_iter()
        .filter(|c| chain.is_none_or(|only| c == only))
        .collect();

    let sem = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
    let mut tasks = Vec::with_capacity(chains.len());
    for chain in chains {
        let permit = sem.clone().acquire_owned().await.expect("semaphore open");
        let remote = Arc::clone(remote);
        let date = date.to_string();
        let matcher = matcher.clone();
        tasks.push(tokio::spawn(async move {
            let _p = permit;
            let text = match remote.read_csv(&chain, PRODUCTS_CSV).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("{chain}: products fetch failed ({e})");
                    return (chain, Vec::new());
                }
            };
            let products = map_chain(&chain, &date, "", &text, "").products;
            let matched: Vec<Product> = products.into_iter().filter(|p| matcher.matches(p)).collect();
            (chain, matched)
        }));
    }

    let mut products = Vec::new();
    let mut hit_chains = BTreeSet::new();
    for task in tasks {
        let Ok((chain, matched)) = task.await else {
            continue;
        };
        if !matched.is_empty() {
            hit_chains.insert(chain);
            products.extend(matched);
        }
    }

    let mut tasks = Vec::with_capacity(hit_chains.len());
    for chain in hit_chains {
        let permit = sem.clone().acquire_owned().await.expect("semaphore open");
        let remote = Arc::clone(remote);
        let date = date.to_string();
        tasks.push(tokio::spawn(async move {
            let _p = permit;
            let stores_text = match remote.read_csv(&chain, STORES_CSV).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("{chain}: stores fetch failed ({e})");
                    return DateBundlePart::default();
                }
            };
            let prices_text = match remote.read_csv(&chain, PRICES_CSV).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("{chain}: prices fetch failed ({e})");
                    return DateBundlePart::default();
                }
            };
            let bundle = map_chain(&chain, &date, &stores_text, "", &prices_text);
            DateBundlePart {
                stores: bundle.stores,
                prices: bundle.prices,
            }
        }));
    }

    let mut stores = Vec::new();
    let mut prices = Vec::new();
    for task in tasks {
        let Ok(part) = task.await else { continue };
        stores.extend(part.stores.into_iter().filter(|s| city_matches(&s.city, city)));
        prices.extend(part.prices);
    }
    (products, stores, prices)
}

#[derive(Default)]
struct DateBundlePart {
    stores: Vec<Store>,
    prices: Vec<Price>,
}

/// Merge matched products into result groups.
///
/// Groups are keyed by barcode when non-empty, else by
/// (chain, product id). Every attached price must reference a store in
/// `stores` (which already carries the city filter), so orphaned prices
/// are skipped. Groups without prices are dropped, the rest are ordered by
/// descending price count and capped.
pub fn merge_groups(products: Vec<Product>, stores: &[Store], prices: Vec<Price>) -> Vec<ProductGroup> {
    let store_index: HashMap<(&str, &str), &Store> = stores
        .iter()
        .map(|s| ((s.chain.as_str(), s.store_id.as_str()), s))
        .collect();

    struct Group {
        first: Product,
        chains: BTreeSet<String>,
        prices: Vec<StorePrice>,
    }

    let mut member: HashMap<(String, String), String> = HashMap::new();
    let mut groups: HashMap<String, Group> = HashMap::new();
    for product in products {
        let key = if product.barcode.is_empty() {
            format!("{}:{}", product.chain, product.product_id)
        } else {
            product.barcode.clone()
        };
        member.insert((product.chain.clone(), product.product_id.clone()), key.clone());
        groups
            .entry(key)
            .and_modify(|g| {
                g.chains.insert(product.chain.clone());
            })
            .or_insert_with(|| Group {
                chains: BTreeSet::from([product.chain.clone()]),
                first: product,
                prices: Vec::new(),
            });
    }

    for price in prices {
        let Some(key) = member.get(&(price.chain.clone(), price.product_id.clone())) else {
            continue;
        };
        let Some(store) = store_index.get(&(price.chain.as_str(), price.store_id.as_str())) else {
            continue;
        };
        let city = store.city.clone();
        let group = groups.get_mut(key).expect("member key implies group");
        group.prices.push(StorePrice {
            chain: price.chain,
            store_id: price.store_id,
            city,
            price: price.price,
            unit_price: price.unit_price,
            best_price_30: price.best_price_30,
            anchor_price: price.anchor_price,
            special_price: price.special_price,
        });
    }

    let mut out: Vec<ProductGroup> = groups
        .into_values()
        .filter(|g| !g.prices.is_empty())
        .map(|mut g| {
            g.prices.sort_by(|a, b| (&a.chain, &a.store_id).cmp(&(&b.chain, &b.store_id)));
            ProductGroup {
                barcode: g.first.barcode,
                name: g.first.name,
                brand: g.first.brand,
                category: g.first.category,
                unit: g.first.unit,
                quantity: g.first.quantity,
                chains: g.chains.into_iter().collect(),
                prices: g.prices,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        b.prices
            .len()
            .cmp(&a.prices.len())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.barcode.cmp(&b.barcode))
    });
    out.truncate(GROUP_LIMIT);
    out
}

/// Price history for one product over the last `days` days, grouped per
/// chain and day. Requires a barcode or a name; barcode wins when both are
/// given.
pub async fn history(
    catalog: &Catalog,
    archive: &ArchiveClient,
    query: &HistoryQuery,
) -> Result<Vec<HistoryDay>> {
    let barcode = query.barcode.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let name = query
        .name
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    if barcode.is_none() && name.is_none() {
        return Err(Error::BadRequest("history requires a barcode or a name"));
    }
    // Barcode wins over name.
    let name = if barcode.is_some() { None } else { name };
    if query.days == 0 {
        return Ok(Vec::new());
    }

    let dates = catalog.recent_success_dates(query.days)?;
    if !dates.is_empty() {
        let mut days = Vec::new();
        for date in &dates {
            if let Some(day) =
                history_day_catalog(catalog, date, barcode, name.as_deref(), query)?
            {
                days.push(day);
            }
        }
        days.sort_by(|a, b| a.date.cmp(&b.date));
        return Ok(days);
    }

    history_remote(archive, barcode, name.as_deref(), query).await
}

fn history_day_catalog(
    catalog: &Catalog,
    date: &str,
    barcode: Option<&str>,
    name: Option<&str>,
    query: &HistoryQuery,
) -> Result<Option<HistoryDay>> {
    let products = catalog.products_for_history(date, barcode, name, query.chain.as_deref())?;
    if products.is_empty() {
        return Ok(None);
    }
    let chains: Vec<String> = products.iter().map(|p| p.chain.clone()).unique().collect();
    let ids: Vec<String> = products
        .iter()
        .map(|p| p.product_id.clone())
        .unique()
        .collect();
    let stores = catalog.stores_for_chains(date, &chains, query.city.as_deref())?;
    let prices = catalog.prices_for(date, &chains, &ids)?;
    Ok(aggregate_day(date, &stores, &prices))
}

async fn history_remote(
    archive: &ArchiveClient,
    barcode: Option<&str>,
    name: Option<&str>,
    query: &HistoryQuery,
) -> Result<Vec<HistoryDay>> {
    let archives = archive.list().await?;
    let dates: Vec<String> = archives.iter().take(query.days).map(|a| a.date.clone()).collect();

    let matcher = match (barcode, name) {
        (Some(b), _) => Matcher::Barcode(b.to_string()),
        (None, Some(n)) => Matcher::Name(n.to_string()),
        (None, None) => unreachable!("validated by history"),
    };

    let mut days = Vec::new();
    for batch in dates.chunks(HISTORY_DATE_BATCH) {
        let results = join_all(
            batch
                .iter()
                .map(|date| history_day_remote(archive, date, matcher.clone(), query)),
        )
        .await;
        days.extend(results.into_iter().flatten());
    }
    days.sort_by(|a, b| a.date.cmp(&b.date));
    Ok(days)
}

async fn history_day_remote(
    archive: &ArchiveClient,
    date: &str,
    matcher: Matcher,
    query: &HistoryQuery,
) -> Option<HistoryDay> {
    let remote = match archive.open(date).await {
        Ok(remote) => Arc::new(remote),
        Err(e) => {
            warn!("{date}: archive unavailable ({e})");
            return None;
        }
    };
    let (products, stores, prices) = fetch_remote_rows(
        &remote,
        date,
        matcher,
        query.chain.as_deref(),
        query.city.as_deref(),
    )
    .await;
    if products.is_empty() {
        return None;
    }
    let ids: HashSet<(&str, &str)> = products
        .iter()
        .map(|p| (p.chain.as_str(), p.product_id.as_str()))
        .collect();
    let prices: Vec<Price> = prices
        .into_iter()
        .filter(|p| ids.contains(&(p.chain.as_str(), p.product_id.as_str())))
        .collect();
    aggregate_day(date, &stores, &prices)
}

/// Group one day's observations by chain. `min_price` is the minimum and
/// `avg_price` the equal-weight arithmetic mean over every store
/// observation. Chains without observations are omitted; a day without any
/// chain is dropped.
fn aggregate_day(date: &str, stores: &[Store], prices: &[Price]) -> Option<HistoryDay> {
    let store_index: HashSet<(&str, &str)> = stores
        .iter()
        .map(|s| (s.chain.as_str(), s.store_id.as_str()))
        .collect();

    let mut by_chain: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for price in prices {
        if store_index.contains(&(price.chain.as_str(), price.store_id.as_str())) {
            by_chain.entry(price.chain.as_str()).or_default().push(price.price);
        }
    }

    let stats: Vec<ChainStat> = by_chain
        .into_iter()
        .map(|(chain, observed)| ChainStat {
            chain: chain.to_string(),
            min_price: observed.iter().copied().fold(f64::INFINITY, f64::min),
            avg_price: observed.as_slice().mean(),
        })
        .collect();

    if stats.is_empty() {
        None
    } else {
        Some(HistoryDay {
            date: date.to_string(),
            prices: stats,
        })
    }
}

/// Cities with at least one store: the catalog union when ingested data
/// exists, else the latest archive, with a fixed major-city floor.
pub async fn cities(catalog: &Catalog, archive: &ArchiveClient) -> Result<Vec<String>> {
    let mut cities = catalog.cities()?;

    if cities.is_empty()
        && let Ok(archives) = archive.list().await
        && let Some(latest) = archives.first()
        && let Ok(remote) = archive.open(&latest.date).await
    {
        let remote = Arc::new(remote);
        let sem = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
        let mut tasks = Vec::new();
        for chain in remote.chains() {
            let permit = sem.clone().acquire_owned().await.expect("semaphore open");
            let remote = Arc::clone(&remote);
            tasks.push(tokio::spawn(async move {
                let _p = permit;
                remote.read_csv(&chain, STORES_CSV).await.unwrap_or_default()
            }));
        }
        let mut seen = BTreeSet::new();
        for task in tasks {
            let Ok(text) = task.await else { continue };
            for rec in crate::table::parse(&text) {
                if let Some(city) = rec.get("city")
                    && !city.is_empty()
                {
                    seen.insert(city.clone());
                }
            }
        }
        cities = seen.into_iter().collect();
    }

    if cities.is_empty() {
        cities = MAJOR_CITIES.iter().map(|c| c.to_string()).collect();
    }
    cities.sort_by_key(|c| collation_key(c));
    cities.dedup();
    Ok(cities)
}

/// Croatian alphabetical order for city lists: č/ć after c, đ after d,
/// š after s, ž after z. Digraphs are not treated specially.
fn collation_key(s: &str) -> Vec<u32> {
    s.chars()
        .map(|c| {
            let lower = c.to_lowercase().next().unwrap_or(c);
            match lower {
                'č' => 'c' as u32 * 10 + 1,
                'ć' => 'c' as u32 * 10 + 2,
                'đ' => 'd' as u32 * 10 + 1,
                'š' => 's' as u32 * 10 + 1,
                'ž' => 'z' as u32 * 10 + 1,
                other => other as u32 * 10,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DateBundle;
    use reqwest::Client;

    fn unroutable_archive() -> ArchiveClient {
        // Query paths answered from the catalog must never touch this.
        ArchiveClient::new(Client::new(), "http://127.0.0.1:1")
    }

    fn store(chain: &str, store_id: &str, date: &str, city: &str) -> Store {
        Store {
            chain: chain.into(),
            store_id: store_id.into(),
            date: date.into(),
            city: city.into(),
            ..Store::default()
        }
    }

    fn product(chain: &str, id: &str, date: &str, barcode: &str, name: &str) -> Product {
        Product {
            chain: chain.into(),
            product_id: id.into(),
            date: date.into(),
            barcode: barcode.into(),
            name: name.into(),
            ..Product::default()
        }
    }

    fn price(chain: &str, store_id: &str, product_id: &str, date: &str, value: f64) -> Price {
        Price {
            chain: chain.into(),
            store_id: store_id.into(),
            product_id: product_id.into(),
            date: date.into(),
            price: value,
            ..Price::default()
        }
    }

    #[test]
    fn merge_groups_by_barcode_across_chains() {
        let date = "2025-06-01";
        let products = vec![
            product("lidl", "A1", date, "590", "Mlijeko"),
            product("spar", "X7", date, "590", "Mlijeko 1L"),
            product("lidl", "A2", date, "", "Kruh"),
        ];
        let stores = vec![
            store("lidl", "s1", date, "Zagreb"),
            store("spar", "t1", date, "Zagreb"),
        ];
        let prices = vec![
            price("lidl", "s1", "A1", date, 1.29),
            price("spar", "t1", "X7", date, 1.35),
            price("lidl", "s1", "A2", date, 0.89),
        ];

        let groups = merge_groups(products, &stores, prices);
        assert_eq!(groups.len(), 2);
        // Two observations beat one.
        assert_eq!(groups[0].barcode, "590");
        assert_eq!(groups[0].chains, vec!["lidl".to_string(), "spar".to_string()]);
        assert_eq!(groups[0].prices.len(), 2);
        assert_eq!(groups[1].name, "Kruh");
    }

    #[test]
    fn merge_skips_orphan_prices_and_empty_groups() {
        let date = "2025-06-01";
        let products = vec![
            product("lidl", "A1", date, "", "Mlijeko"),
            product("lidl", "A2", date, "", "Jogurt"),
        ];
        // Only one store survives the (already applied) city filter.
        let stores = vec![store("lidl", "s1", date, "Zagreb")];
        let prices = vec![
            price("lidl", "s1", "A1", date, 1.29),
            price("lidl", "s9", "A1", date, 1.05), // unknown store
            price("lidl", "s1", "ZZ", date, 9.99), // unknown product
            price("lidl", "s2", "A2", date, 2.49), // filtered-out store
        ];

        let groups = merge_groups(products, &stores, prices);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Mlijeko");
        assert_eq!(groups[0].prices.len(), 1);
        assert_eq!(groups[0].prices[0].city, "Zagreb");
    }

    #[test]
    fn merge_caps_group_count() {
        let date = "2025-06-01";
        let mut products = Vec::new();
        let mut prices = Vec::new();
        for i in 0..70 {
            products.push(product("lidl", &format!("P{i}"), date, "", &format!("Artikl {i}")));
            prices.push(price("lidl", "s1", &format!("P{i}"), date, 1.0));
        }
        let stores = vec![store("lidl", "s1", date, "Zagreb")];
        assert_eq!(merge_groups(products, &stores, prices).len(), GROUP_LIMIT);
    }

    #[tokio::test]
    async fn empty_query_short_circuits() {
        let catalog = Catalog::open_in_memory().unwrap();
        let archive = unroutable_archive();
        let result = search(&catalog, &archive, "2025-06-01", "   ", None).await.unwrap();
        assert!(result.products.is_empty());
        assert_eq!(result.actual_date, "2025-06-01");
    }

    #[tokio::test]
    async fn catalog_search_hit() {
        let catalog = Catalog::open_in_memory().unwrap();
        let date = "2025-06-01";
        catalog
            .replace_date(
                date,
                &DateBundle {
                    stores: vec![store("lidl", "s1", date, "Zagreb")],
                    products: vec![product("lidl", "A1", date, "5901234123457", "Mlijeko 1L")],
                    prices: vec![price("lidl", "s1", "A1", date, 1.29)],
                },
            )
            .unwrap();

        let result = search(&catalog, &unroutable_archive(), date, "mlij", Some("Zagreb"))
            .await
            .unwrap();
        assert_eq!(result.source, Source::Db);
        assert_eq!(result.actual_date, date);
        assert_eq!(result.products.len(), 1);
        assert_eq!(result.products[0].prices.len(), 1);
        assert_eq!(result.products[0].prices[0].price, 1.29);
    }

    #[tokio::test]
    async fn search_falls_back_to_latest_ingested() {
        let catalog = Catalog::open_in_memory().unwrap();
        let date = "2025-05-30";
        catalog
            .replace_date(
                date,
                &DateBundle {
                    stores: vec![store("spar", "t1", date, "Split")],
                    products: vec![product("spar", "J1", date, "", "Jaja M")],
                    prices: vec![price("spar", "t1", "J1", date, 2.10)],
                },
            )
            .unwrap();

        let result = search(&catalog, &unroutable_archive(), "2025-06-02", "jaja", Some("Split"))
            .await
            .unwrap();
        assert_eq!(result.source, Source::Db);
        assert_eq!(result.actual_date, "2025-05-30");
        assert_eq!(result.products.len(), 1);
    }

    #[tokio::test]
    async fn catalog_search_folds_diacritics_like_remote() {
        let catalog = Catalog::open_in_memory().unwrap();
        let date = "2025-06-01";
        catalog
            .replace_date(
                date,
                &DateBundle {
                    stores: vec![store("ktc", "k1", date, "Šibenik")],
                    products: vec![product("ktc", "C3", date, "", "Čokolada mliječna")],
                    prices: vec![price("ktc", "k1", "C3", date, 2.79)],
                },
            )
            .unwrap();

        let result = search(&catalog, &unroutable_archive(), date, "ČOKOLADA", Some("šibenik"))
            .await
            .unwrap();
        assert_eq!(result.source, Source::Db);
        assert_eq!(result.products.len(), 1);
        assert_eq!(result.products[0].prices.len(), 1);
        assert_eq!(result.products[0].prices[0].city, "Šibenik");
    }

    #[tokio::test]
    async fn city_filter_drops_unmatched_stores() {
        let catalog = Catalog::open_in_memory().unwrap();
        let date = "2025-06-01";
        catalog
            .replace_date(
                date,
                &DateBundle {
                    stores: vec![
                        store("lidl", "s1", date, "Zagreb"),
                        store("lidl", "s2", date, "Split"),
                    ],
                    products: vec![product("lidl", "A1", date, "", "Kruh")],
                    prices: vec![
                        price("lidl", "s1", "A1", date, 0.99),
                        price("lidl", "s2", "A1", date, 0.95),
                    ],
                },
            )
            .unwrap();

        let result = search(&catalog, &unroutable_archive(), date, "kruh", Some("zagreb"))
            .await
            .unwrap();
        assert_eq!(result.products.len(), 1);
        let prices = &result.products[0].prices;
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].city, "Zagreb");
    }

    #[tokio::test]
    async fn history_requires_barcode_or_name() {
        let catalog = Catalog::open_in_memory().unwrap();
        let err = history(&catalog, &unroutable_archive(), &HistoryQuery {
            days: 7,
            ..HistoryQuery::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn history_zero_days_is_empty() {
        let catalog = Catalog::open_in_memory().unwrap();
        let days = history(&catalog, &unroutable_archive(), &HistoryQuery {
            barcode: Some("590".into()),
            days: 0,
            ..HistoryQuery::default()
        })
        .await
        .unwrap();
        assert!(days.is_empty());
    }

    #[tokio::test]
    async fn history_aggregates_per_chain_and_day() {
        let catalog = Catalog::open_in_memory().unwrap();
        let barcode = "5901234123457";
        let per_day: [(&str, &[f64]); 3] = [
            ("2025-06-01", &[1.19, 1.29]),
            ("2025-06-02", &[1.25]),
            ("2025-06-03", &[1.29, 1.29]),
        ];
        for (date, values) in per_day {
            let mut bundle = DateBundle {
                stores: Vec::new(),
                products: vec![product("lidl", "A1", date, barcode, "Mlijeko 1L")],
                prices: Vec::new(),
            };
            for (i, value) in values.iter().enumerate() {
                let sid = format!("s{i}");
                bundle.stores.push(store("lidl", &sid, date, "Zagreb"));
                bundle.prices.push(price("lidl", &sid, "A1", date, *value));
            }
            catalog.replace_date(date, &bundle).unwrap();
        }

        let days = history(&catalog, &unroutable_archive(), &HistoryQuery {
            barcode: Some(barcode.into()),
            chain: Some("lidl".into()),
            days: 7,
            ..HistoryQuery::default()
        })
        .await
        .unwrap();

        assert_eq!(days.len(), 3);
        let dates: Vec<&str> = days.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["2025-06-01", "2025-06-02", "2025-06-03"]);

        let first = &days[0].prices[0];
        assert_eq!(first.chain, "lidl");
        assert!((first.min_price - 1.19).abs() < 1e-9);
        assert!((first.avg_price - 1.24).abs() < 1e-9);

        for day in &days {
            for stat in &day.prices {
                assert!(stat.min_price <= stat.avg_price + 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn history_barcode_wins_over_name() {
        let catalog = Catalog::open_in_memory().unwrap();
        let date = "2025-06-01";
        catalog
            .replace_date(
                date,
                &DateBundle {
                    stores: vec![store("lidl", "s1", date, "Zagreb")],
                    products: vec![
                        product("lidl", "A1", date, "111", "Mlijeko"),
                        product("lidl", "A2", date, "222", "Mlijeko posebno"),
                    ],
                    prices: vec![
                        price("lidl", "s1", "A1", date, 1.0),
                        price("lidl", "s1", "A2", date, 2.0),
                    ],
                },
            )
            .unwrap();

        let days = history(&catalog, &unroutable_archive(), &HistoryQuery {
            barcode: Some("111".into()),
            name: Some("mlijeko".into()),
            days: 7,
            ..HistoryQuery::default()
        })
        .await
        .unwrap();
        assert_eq!(days.len(), 1);
        let stat = &days[0].prices[0];
        assert!((stat.avg_price - 1.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_omits_chains_without_observations() {
        let date = "2025-06-01";
        let stores = vec![store("lidl", "s1", date, "Zagreb")];
        let prices = vec![
            price("lidl", "s1", "A1", date, 1.0),
            price("spar", "t1", "A1", date, 2.0), // store not in index
        ];
        let day = aggregate_day(date, &stores, &prices).unwrap();
        assert_eq!(day.prices.len(), 1);
        assert_eq!(day.prices[0].chain, "lidl");

        assert!(aggregate_day(date, &stores, &[]).is_none());
    }

    #[test]
    fn croatian_collation_order() {
        let mut cities = vec![
            "Zagreb".to_string(),
            "Šibenik".to_string(),
            "Split".to_string(),
            "Čakovec".to_string(),
            "Cavtat".to_string(),
        ];
        cities.sort_by_key(|c| collation_key(c));
        assert_eq!(cities, vec!["Cavtat", "Čakovec", "Split", "Šibenik", "Zagreb"]);
    }

    #[tokio::test]
    async fn cities_floor_when_catalog_and_upstream_empty() {
        let catalog = Catalog::open_in_memory().unwrap();
        let listed = cities(&catalog, &unroutable_archive()).await.unwrap();
        assert!(listed.contains(&"Zagreb".to_string()));
        assert!(listed.contains(&"Split".to_string()));
    }
}
