//! Gift auction marketplace client

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use super::{open, ClientOptions};
use crate::error::{AutobidError, Result};
use crate::transport::FloodControlledRequester;

pub const MARKET_HOST: &str = "rs-gifts.tonnel.network";

const PAGE_GIFTS_URL: &str = "https://rs-gifts.tonnel.network/api/pageGifts";

/// Page size used for floor lookups
const FLOOR_PAGE_LIMIT: u32 = 30;

/// Minimum raise over the current highest bid
const BID_STEP: f64 = 0.05;

const ACTIVE_AUCTIONS_FILTER: &str =
    r#"{"auction_id":{"$exists":true},"status":"active","asset":"TON"}"#;
const ENDING_SOONEST: &str = r#"{"auctionEndTime":1,"gift_id":-1}"#;
const CHEAPEST_FIRST: &str = r#"{"price":1,"gift_id":-1}"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BidHistoryEntry {
    pub bidder: f64,
    pub amount: f64,
    pub asset: String,
    #[serde(rename = "_id")]
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Auction {
    #[serde(rename = "_id")]
    pub id: String,
    pub gift_id: i64,
    pub seller: i64,
    pub auction_id: String,
    #[serde(rename = "startingBid")]
    pub starting_bid: f64,
    #[serde(rename = "bidHistory")]
    pub bid_history: Vec<BidHistoryEntry>,
    #[serde(rename = "auctionEndTime")]
    pub auction_end_time: Option<DateTime<Utc>>,
    pub status: String,
    pub gift_name: String,
    pub gift_num: i64,
    pub model: String,
    pub backdrop: String,
    pub symbol: String,
    pub asset: String,
    #[serde(rename = "auctionStartTime")]
    pub auction_start_time: Option<DateTime<Utc>>,
    #[serde(rename = "__v")]
    pub version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gift {
    pub gift_num: i64,
    pub gift_id: i64,
    pub name: String,
    pub model: String,
    pub asset: String,
    pub symbol: String,
    pub backdrop: String,
    #[serde(rename = "availabilityIssued")]
    pub availability_issued: i64,
    #[serde(rename = "availabilityTotal")]
    pub availability_total: i64,
    #[serde(rename = "backdropData")]
    pub backdrop_data: Option<Map<String, Value>>,
    pub message_in_channel: i64,
    pub status: String,
    pub limited: bool,
    pub auction_id: Option<String>,
    pub auction: Option<Auction>,
    pub export_at: Option<DateTime<Utc>>,
    #[serde(rename = "customEmojiId")]
    pub custom_emoji_id: String,
    #[serde(rename = "premarketData")]
    pub premarket_data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl Gift {
    /// Smallest acceptable next bid: the starting bid, or 5% over the last bid
    pub fn min_bid(&self) -> Option<f64> {
        let auction = self.auction.as_ref()?;
        match auction.bid_history.last() {
            Some(highest) => Some(highest.amount + highest.amount * BID_STEP),
            None => Some(auction.starting_bid),
        }
    }

    pub fn auction_end(&self) -> Option<DateTime<Utc>> {
        self.auction.as_ref().and_then(|a| a.auction_end_time)
    }

    /// Still open at `now` with a real gift id
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.gift_id >= 0 && self.auction_end().map(|end| end > now).unwrap_or(false)
    }
}

/// Collection slug as used in links and floor lookups: ASCII word characters only, lowercased
pub fn short_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Drop parenthesized rarity suffixes such as `" (1.5%)"`
pub fn strip_rarity(attribute: &str) -> String {
    let mut out = String::with_capacity(attribute.len());
    let mut rest = attribute;

    while let Some(open) = rest.find('(') {
        match rest[open..].find(')') {
            Some(close) => {
                out.push_str(rest[..open].trim_end());
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// `backdrop`, rarity suffix ignored, is one of `rare_backdrops` (case-insensitive)
pub fn is_rare_backdrop(backdrop: &str, rare_backdrops: &[String]) -> bool {
    let backdrop = strip_rarity(backdrop);
    rare_backdrops
        .iter()
        .any(|rare| rare.eq_ignore_ascii_case(&backdrop))
}

#[derive(Debug, Serialize)]
struct PageRequest<'a> {
    page: u32,
    limit: u32,
    sort: &'a str,
    filter: String,
    #[serde(rename = "ref")]
    referrer: i64,
    price_range: Option<Value>,
    user_auth: &'a str,
}

impl<'a> PageRequest<'a> {
    fn new(page: u32, limit: u32, sort: &'a str, filter: String) -> Self {
        Self {
            page,
            limit,
            sort,
            filter,
            referrer: 0,
            price_range: None,
            user_auth: "",
        }
    }
}

fn floor_filter(gift_name: &str, model: Option<&str>, backdrop: Option<&str>) -> String {
    let mut filter = json!({
        "price": {"$exists": true},
        "buyer": {"$exists": false},
        "gift_name": gift_name,
        "asset": "TON",
    });
    if let Some(map) = filter.as_object_mut() {
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            map.insert("model".to_string(), json!(model));
        }
        if let Some(backdrop) = backdrop.filter(|b| !b.is_empty()) {
            map.insert("backdrop".to_string(), json!({ "$in": [backdrop] }));
        }
    }
    filter.to_string()
}

/// Client for the auction marketplace listing endpoint
pub struct MarketClient {
    requester: FloodControlledRequester,
    url: Url,
}

impl MarketClient {
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        Ok(Self {
            requester: open(MARKET_HOST, options).await?,
            url: Url::parse(PAGE_GIFTS_URL)?,
        })
    }

    /// One page of active TON auctions, soonest ending first. Pages start at 1.
    pub async fn auctions(&mut self, page: u32, limit: u32) -> Result<Vec<Gift>> {
        let body = PageRequest::new(page, limit, ENDING_SOONEST, ACTIVE_AUCTIONS_FILTER.to_string());
        self.page_gifts(&body).await
    }

    /// Cheapest listed gift of a collection, optionally narrowed to one model
    /// or backdrop. `None` when nothing is listed.
    pub async fn floor(
        &mut self,
        gift_name: &str,
        model: Option<&str>,
        backdrop: Option<&str>,
    ) -> Result<Option<Gift>> {
        let body = PageRequest::new(
            1,
            FLOOR_PAGE_LIMIT,
            CHEAPEST_FIRST,
            floor_filter(gift_name, model, backdrop),
        );
        let gifts = self.page_gifts(&body).await?;
        Ok(gifts.into_iter().next())
    }

    async fn page_gifts(&mut self, body: &PageRequest<'_>) -> Result<Vec<Gift>> {
        let payload = serde_json::to_vec(body)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .requester
            .call(Method::POST, self.url.clone(), Some(Bytes::from(payload)), headers)
            .await?;

        let gifts: Vec<Gift> = serde_json::from_slice(&response.body).map_err(AutobidError::Json)?;
        debug!("{} returned {} gifts", MARKET_HOST, gifts.len());
        Ok(gifts)
    }
}
