//! Collection floor-price client

use std::collections::HashMap;

use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{open, ClientOptions};
use crate::error::{AutobidError, Result};
use crate::transport::FloodControlledRequester;

pub const FLOOR_HOST: &str = "portals-market.com";

const FILTERS_URL: &str = "https://portals-market.com/api/collections/filters";

/// Floor prices keyed by collection short name. Prices arrive as decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloorPrices {
    pub collections: HashMap<String, Value>,
    pub floor_prices: HashMap<String, CollectionFloorPrices>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionFloorPrices {
    pub backdrops: HashMap<String, String>,
    pub models: HashMap<String, String>,
    pub symbols: HashMap<String, String>,
}

impl FloorPrices {
    pub fn model_floor(&self, short_name: &str, model: &str) -> Result<f64> {
        let collection = self.collection(short_name)?;
        parse_floor(collection.models.get(model), model, short_name)
    }

    pub fn backdrop_floor(&self, short_name: &str, backdrop: &str) -> Result<f64> {
        let collection = self.collection(short_name)?;
        parse_floor(collection.backdrops.get(backdrop), backdrop, short_name)
    }

    fn collection(&self, short_name: &str) -> Result<&CollectionFloorPrices> {
        self.floor_prices
            .get(short_name)
            .ok_or_else(|| AutobidError::Request(format!("no floor prices for {}", short_name)))
    }
}

fn parse_floor(raw: Option<&String>, attribute: &str, short_name: &str) -> Result<f64> {
    let raw = raw.ok_or_else(|| {
        AutobidError::Request(format!("no floor for \"{}\" ({})", attribute, short_name))
    })?;
    raw.trim().parse::<f64>().map_err(|e| {
        AutobidError::Request(format!(
            "invalid floor for \"{}\" ({}): {}",
            attribute, short_name, e
        ))
    })
}

pub struct FloorClient {
    requester: FloodControlledRequester,
}

impl FloorClient {
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        Ok(Self {
            requester: open(FLOOR_HOST, options).await?,
        })
    }

    /// Floor prices for one collection, looked up by short name
    pub async fn floor_prices(&mut self, short_name: &str) -> Result<FloorPrices> {
        let url = Url::parse_with_params(FILTERS_URL, &[("short_names", short_name)])?;

        let response = self
            .requester
            .call(Method::GET, url, None, HeaderMap::new())
            .await?;

        Ok(serde_json::from_slice(&response.body)?)
    }
}
