use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::schedule::parse_timestamp;

const PAGE_KEY_PARAM: &str = "page[key]";
const USER_AGENT: &str = concat!("wipe_scraper/", env!("CARGO_PKG_VERSION"));

/// Filters for one listing request. `cursor` is the `page[key]` handed
/// back by the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub country: String,
    pub distance: u32,
    pub min_players: u32,
    pub page_size: u32,
    pub cursor: Option<String>,
}

impl PageQuery {
    pub fn with_cursor(&self, cursor: Option<String>) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }

    /// Query pairs in a fixed order, newest wipe first.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("filter[game]", "rust".to_string()),
            ("filter[status]", "online".to_string()),
            ("filter[countries][]", self.country.clone()),
            ("filter[maxDistance]", self.distance.to_string()),
            ("filter[players][min]", self.min_players.to_string()),
            ("page[size]", self.page_size.to_string()),
            ("sort", "-details.rust_last_wipe".to_string()),
        ];
        if let Some(cursor) = &self.cursor {
            params.push((PAGE_KEY_PARAM, cursor.clone()));
        }
        params
    }
}

/// One page of the server listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub items: Vec<ListingEntry>,
    pub next_cursor: Option<String>,
}

/// A `data[]` element. `attributes` missing means the entry is unusable.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attributes: Option<RawListingItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawListingItem {
    pub id: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub rank: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub players: Option<i64>,
    #[serde(default)]
    pub max_players: Option<i64>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub details: Option<ServerDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerDetails {
    #[serde(default)]
    pub rust_description: Option<String>,
    #[serde(default)]
    pub rust_last_wipe: Option<String>,
    #[serde(default)]
    pub rust_next_wipe: Option<String>,
    #[serde(default)]
    pub rust_next_wipe_map: Option<String>,
    #[serde(default)]
    pub rust_next_wipe_full: Option<String>,
    #[serde(default)]
    pub rust_next_wipe_bp: Option<String>,
}

impl RawListingItem {
    pub fn bm_id(&self) -> Option<i64> {
        self.id.trim().parse().ok()
    }

    pub fn title(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn description(&self) -> &str {
        self.details
            .as_ref()
            .and_then(|d| d.rust_description.as_deref())
            .unwrap_or("")
    }

    pub fn address(&self) -> Option<String> {
        match (&self.ip, self.port) {
            (Some(ip), Some(port)) => Some(format!("{}:{}", ip, port)),
            (Some(ip), None) => Some(ip.clone()),
            _ => None,
        }
    }

    pub fn last_wipe(&self) -> Option<DateTime<Utc>> {
        self.detail(|d| d.rust_last_wipe.as_deref())
    }

    /// Regular next wipe; the map wipe takes precedence.
    pub fn next_wipe(&self) -> Option<DateTime<Utc>> {
        self.detail(|d| d.rust_next_wipe_map.as_deref())
            .or_else(|| self.detail(|d| d.rust_next_wipe.as_deref()))
    }

    /// Next full (blueprint) wipe.
    pub fn next_wipe_full(&self) -> Option<DateTime<Utc>> {
        self.detail(|d| d.rust_next_wipe_bp.as_deref())
            .or_else(|| self.detail(|d| d.rust_next_wipe_full.as_deref()))
    }

    fn detail(&self, field: impl Fn(&ServerDetails) -> Option<&str>) -> Option<DateTime<Utc>> {
        self.details.as_ref().and_then(field).and_then(parse_timestamp)
    }
}

#[derive(Deserialize)]
struct ServerListResponse {
    #[serde(default)]
    data: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<String>,
}

/// Source of listing pages.
#[async_trait]
pub trait Fetcher {
    async fn fetch_page(&self, query: &PageQuery) -> Result<ListingPage, TransportError>;
}

#[async_trait]
impl<T: Fetcher + Sync + ?Sized> Fetcher for &T {
    async fn fetch_page(&self, query: &PageQuery) -> Result<ListingPage, TransportError> {
        (**self).fetch_page(query).await
    }
}

pub struct BattleMetricsClient {
    http: reqwest::Client,
    base_url: Url,
}

impl BattleMetricsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid API base URL {}", base_url))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn page_url(&self, query: &PageQuery) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().extend_pairs(query.params());
        url
    }
}

#[async_trait]
impl Fetcher for BattleMetricsClient {
    async fn fetch_page(&self, query: &PageQuery) -> Result<ListingPage, TransportError> {
        let url = self.page_url(query);
        debug!("Fetching server list: {}", url);

        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        parse_listing(&body)
    }
}

/// Decode a listing response body. Entries are decoded one by one so a
/// single bad entry only loses its attributes, not the page.
pub fn parse_listing(body: &str) -> Result<ListingPage, TransportError> {
    let response: ServerListResponse = serde_json::from_str(body)?;
    let items = response
        .data
        .ok_or(TransportError::NoData)?
        .into_iter()
        .map(decode_entry)
        .collect();
    let next_cursor = response
        .links
        .and_then(|l| l.next)
        .and_then(|next| cursor_from_link(&next));
    Ok(ListingPage { items, next_cursor })
}

fn decode_entry(raw: serde_json::Value) -> ListingEntry {
    let id = raw.get("id").and_then(|v| v.as_str()).map(str::to_string);
    match serde_json::from_value::<ListingEntry>(raw) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(id = ?id, "Undecodable listing entry: {}", e);
            ListingEntry {
                id,
                attributes: None,
            }
        }
    }
}

fn cursor_from_link(link: &str) -> Option<String> {
    let url = match Url::parse(link) {
        Ok(url) => url,
        Err(e) => {
            warn!("Unparseable next link {}: {}", link, e);
            return None;
        }
    };
    let cursor = url
        .query_pairs()
        .find(|(k, _)| k == PAGE_KEY_PARAM)
        .map(|(_, v)| v.into_owned());
    if cursor.is_none() {
        warn!("Next link without {}: {}", PAGE_KEY_PARAM, link);
    }
    cursor
}
