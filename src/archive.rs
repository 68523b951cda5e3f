//! Client for the upstream archive service: discovery, size probes, and
//! per-chain member reads built on the range-fetch ZIP reader.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::zip::{DirectoryCache, Entry, RemoteZip};

/// Upstream archive list entries stay fresh this long.
const LIST_TTL: Duration = Duration::from_secs(3600);
/// Deadline for every upstream request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_BASE_URL: &str = "https://api.cijene.dev";

/// The three member files each chain folder carries.
pub const STORES_CSV: &str = "stores.csv";
pub const PRODUCTS_CSV: &str = "products.csv";
pub const PRICES_CSV: &str = "prices.csv";

/// One row of `GET {base}/v0/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveInfo {
    pub date: String,
    pub url: String,
    pub size: u64,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    archives: Vec<ArchiveInfo>,
}

/// Shared HTTP client with the archive-service defaults.
pub fn mk_client() -> Result<Client> {
    let client = Client::builder()
        .user_agent(concat!("cjenik/", env!("CARGO_PKG_VERSION")))
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    Ok(client)
}

pub struct ArchiveClient {
    client: Client,
    base_url: String,
    directories: DirectoryCache,
    list_cache: Mutex<Option<(Instant, Arc<Vec<ArchiveInfo>>)>>,
}

impl ArchiveClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            directories: DirectoryCache::default(),
            list_cache: Mutex::new(None),
        }
    }

    pub fn archive_url(&self, date: &str) -> String {
        format!("{}/v0/archive/{date}.zip", self.base_url)
    }

    /// Published archives, newest first. Cached for an hour.
    pub async fn list(&self) -> Result<Arc<Vec<ArchiveInfo>>> {
        let mut cache = self.list_cache.lock().await;
        if let Some((fetched, archives)) = cache.as_ref()
            && fetched.elapsed() < LIST_TTL
        {
            return Ok(Arc::clone(archives));
        }

        let url = format!("{}/v0/list", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "list request returned {}",
                resp.status()
            )));
        }
        let mut archives = resp.json::<ListResponse>().await?.archives;
        archives.sort_by(|a, b| b.date.cmp(&a.date));
        let archives = Arc::new(archives);
        *cache = Some((Instant::now(), Arc::clone(&archives)));
        Ok(archives)
    }

    /// Resolve a requested date against the published list: an exact match
    /// wins, anything else falls back to the newest published date.
    pub async fn resolve_date(&self, date: &str) -> Result<String> {
        let archives = self.list().await?;
        if archives.iter().any(|a| a.date == date) {
            return Ok(date.to_string());
        }
        archives
            .first()
            .map(|a| a.date.clone())
            .ok_or_else(|| Error::NotFound(date.to_string()))
    }

    /// `Content-Length` of the archive for `date`.
    async fn probe_size(&self, url: &str) -> Result<u64> {
        let resp = self.client.head(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "size probe of {url} returned {}",
                resp.status()
            )));
        }
        resp.headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Upstream(format!("size probe of {url} had no content length")))
    }

    /// Open the archive for `date`: one HEAD for the size, then the central
    /// directory (served from the per-URL cache when the size still
    /// matches).
    pub async fn open(&self, date: &str) -> Result<RemoteArchive> {
        let url = self.archive_url(date);
        let size = self.probe_size(&url).await?;
        let zip = RemoteZip::new(self.client.clone(), url.clone(), size);

        let entries = match self.directories.get(&url, size) {
            Some(entries) => {
                debug!("directory cache hit for {url}");
                entries
            }
            None => {
                let entries = Arc::new(zip.entries().await?);
                self.directories.put(&url, size, Arc::clone(&entries));
                entries
            }
        };

        Ok(RemoteArchive { zip, entries })
    }
}

/// An opened archive: the range reader plus its parsed directory.
pub struct RemoteArchive {
    zip: RemoteZip,
    entries: Arc<Vec<Entry>>,
}

impl RemoteArchive {
    /// Top-level directory names containing at least one sub-path. Chain
    /// codes not on any known list pass through unchanged.
    pub fn chains(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter_map(|e| {
                let (chain, rest) = e.name.split_once('/')?;
                (!chain.is_empty() && !rest.is_empty()).then(|| chain.to_string())
            })
            .collect()
    }

    /// Read `{chain}/{file}` as text. Absent members are common for some
    /// chains on some days and yield empty text.
    pub async fn read_csv(&self, chain: &str, file: &str) -> Result<String> {
        let name = format!("{chain}/{file}");
        match self.entries.iter().find(|e| e.name == name) {
            Some(entry) => Ok(self.zip.read_text(entry).await?),
            None => Ok(String::new()),
        }
    }
}
