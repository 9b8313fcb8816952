use crate::api::ClientOptions;
use crate::error::{AutobidError, Result};
use crate::models::ProxyEndpoint;
use crate::transport::{FloodPolicy, ProxyPool, TlsMode};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport and retry configuration
    pub transport: TransportConfig,
    /// Fetch cycle configuration
    pub fetch: FetchConfig,
    /// Logging configuration
    pub log: LogConfig,
    /// Chat alert target; alerts are disabled when unset
    pub alert: Option<AlertConfig>,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upstream proxies, drawn at random per connection (empty = direct)
    pub proxies: Vec<ProxyEndpoint>,
    /// Accept any server certificate
    pub tls_skip_verify: bool,
    /// Dial a fresh connection for every request
    pub force_reconnect: bool,
    /// Dial + tunnel + handshake timeout in seconds
    pub connect_timeout: u64,
    /// Per-exchange timeout in seconds
    pub request_timeout: u64,
    /// Reconnect budget for dropped connections
    pub max_retries: u32,
    /// 429 responses tolerated per call
    pub flood_retries: u32,
    /// First flood-wait backoff in seconds
    pub flood_wait: u64,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Pages skipped before the first fetched page
    pub gifts_offset: u32,
    /// Auctions per page
    pub gifts_per_fetch: u32,
    /// Floor lookups in flight at once
    pub concurrent_requests: usize,
    /// Pause between fetch cycles in seconds
    pub poll_interval: u64,
    /// Backdrops priced by backdrop floor instead of model floor
    pub rare_backdrops: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Bot token
    pub token: String,
    /// Chat receiving the alerts
    pub chat_id: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            transport: TransportConfig {
                proxies: parse_proxies(&get_env_or("PROXIES", ""))?,
                tls_skip_verify: parse_bool("TLS_SKIP_VERIFY", "false")?,
                force_reconnect: parse_bool("FORCE_RECONNECT", "false")?,
                connect_timeout: parse_env("CONNECT_TIMEOUT", "10", "a number of seconds")?,
                request_timeout: parse_env("REQUEST_TIMEOUT", "60", "a number of seconds")?,
                max_retries: parse_env("TRANSPORT_MAX_RETRIES", "3", "a valid number")?,
                flood_retries: parse_env("FLOOD_RETRIES", "3", "a valid number")?,
                flood_wait: parse_env("FLOOD_WAIT", "5", "a number of seconds")?,
            },
            fetch: FetchConfig {
                gifts_offset: parse_env("GIFTS_OFFSET", "0", "a valid number")?,
                gifts_per_fetch: parse_env("GIFTS_PER_FETCH", "30", "a valid number")?,
                concurrent_requests: parse_env("CONCURRENT_REQUESTS", "5", "a valid number")?,
                poll_interval: parse_env("POLL_INTERVAL", "30", "a number of seconds")?,
                rare_backdrops: split_list(&get_env_or("RARE_BACKDROPS", "")),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
            alert: alert_from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fetch.gifts_per_fetch == 0 {
            return Err(AutobidError::InvalidConfig(
                "GIFTS_PER_FETCH must be at least 1".into(),
            ));
        }
        if self.fetch.concurrent_requests == 0 {
            return Err(AutobidError::InvalidConfig(
                "CONCURRENT_REQUESTS must be at least 1".into(),
            ));
        }
        if self.transport.connect_timeout == 0 || self.transport.request_timeout == 0 {
            return Err(AutobidError::InvalidConfig(
                "CONNECT_TIMEOUT and REQUEST_TIMEOUT must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn proxy_pool(&self) -> ProxyPool {
        ProxyPool::new(self.transport.proxies.clone())
    }

    /// Client settings for every API client built from this configuration
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            proxies: self.proxy_pool(),
            flood: FloodPolicy {
                max_flood_retries: self.transport.flood_retries,
                base_wait: Duration::from_secs(self.transport.flood_wait),
                transient_retries: self.transport.max_retries,
            },
            tls_mode: TlsMode::from_skip_verify(self.transport.tls_skip_verify),
            force_reconnect: self.transport.force_reconnect,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout),
            request_timeout: Duration::from_secs(self.transport.request_timeout),
            ..Default::default()
        }
    }

    /// First marketplace page to fetch (pages start at 1)
    pub fn first_page(&self) -> u32 {
        self.fetch.gifts_offset.saturating_add(1)
    }
}

/// `TOKEN` enables alerts, after which `CHAT_ID` is required
fn alert_from_env() -> Result<Option<AlertConfig>> {
    let token = get_env_or("TOKEN", "").trim().to_string();
    if token.is_empty() {
        return Ok(None);
    }

    let chat_id: i64 = parse_env("CHAT_ID", "", "a valid chat id")?;
    if chat_id == 0 {
        return Err(AutobidError::InvalidConfig(
            "CHAT_ID must be a valid chat id".into(),
        ));
    }
    Ok(Some(AlertConfig { token, chat_id }))
}

fn parse_proxies(raw: &str) -> Result<Vec<ProxyEndpoint>> {
    split_list(raw)
        .iter()
        .map(|entry| {
            ProxyEndpoint::parse(entry).map_err(|e| {
                AutobidError::InvalidConfig(format!("PROXIES entry is invalid: {}", e))
            })
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: &str, what: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| AutobidError::InvalidConfig(format!("{} must be {}", key, what)))
}

fn parse_bool(key: &str, default: &str) -> Result<bool> {
    match get_env_or(key, default).trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(AutobidError::InvalidConfig(format!(
            "{} must be true or false",
            key
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
