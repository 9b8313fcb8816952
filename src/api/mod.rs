//! Thin HTTPS clients for the marketplace, floor-price, IP-echo and alert services
//!
//! Each client owns one flood-controlled transport to its host and only
//! decodes what comes back.

pub mod alert;
pub mod floor;
pub mod ip;
pub mod market;

use std::sync::Arc;
use std::time::Duration;

use http::header::ACCEPT;
use http::HeaderValue;

use crate::error::Result;
use crate::transport::connector::DEFAULT_CONNECT_TIMEOUT;
use crate::transport::client::DEFAULT_REQUEST_TIMEOUT;
use crate::transport::{
    default_headers, CancelSignal, Dialer, FloodControlledRequester, FloodPolicy, ProxyPool,
    Sleeper, TlsMode, TlsTransport, TransportOptions,
};

pub use alert::AlertClient;
pub use floor::{CollectionFloorPrices, FloorClient, FloorPrices};
pub use ip::IpEchoClient;
pub use market::{Auction, BidHistoryEntry, Gift, MarketClient};

const ACCEPT_ANY: &str = "application/json, text/plain, */*";

/// Settings shared by every API client
#[derive(Clone)]
pub struct ClientOptions {
    pub proxies: ProxyPool,
    pub flood: FloodPolicy,
    pub tls_mode: TlsMode,
    pub force_reconnect: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub cancel: Option<CancelSignal>,
    pub dialer: Option<Arc<dyn Dialer>>,
    pub sleeper: Option<Arc<dyn Sleeper>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proxies: ProxyPool::direct(),
            flood: FloodPolicy::default(),
            tls_mode: TlsMode::Verify,
            force_reconnect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel: None,
            dialer: None,
            sleeper: None,
        }
    }
}

impl ClientOptions {
    /// Same settings over a different proxy pool
    pub fn with_proxies(&self, proxies: ProxyPool) -> Self {
        Self {
            proxies,
            ..self.clone()
        }
    }
}

/// Open a flood-controlled transport to `host`
async fn open(host: &str, options: &ClientOptions) -> Result<FloodControlledRequester> {
    let mut headers = default_headers();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_ANY));

    let transport = TlsTransport::connect(
        host,
        TransportOptions {
            tls_mode: options.tls_mode,
            force_reconnect: options.force_reconnect,
            proxies: options.proxies.clone(),
            default_headers: headers,
            connect_timeout: options.connect_timeout,
            request_timeout: options.request_timeout,
            cancel: options.cancel.clone(),
            dialer: options.dialer.clone(),
            ..Default::default()
        },
    )
    .await?;

    let mut requester = FloodControlledRequester::new(transport, options.flood);
    if let Some(cancel) = &options.cancel {
        requester = requester.with_cancel(cancel.clone());
    }
    if let Some(sleeper) = &options.sleeper {
        requester = requester.with_sleeper(sleeper.clone());
    }
    Ok(requester)
}
