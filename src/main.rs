//! Autobid - Entry Point
//!
//! Verifies every configured proxy, then polls the auction marketplace and
//! looks up collection floors until shutdown.

use std::pin::pin;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autobid::api::market::{is_rare_backdrop, short_name, strip_rarity};
use autobid::api::{AlertClient, ClientOptions, FloorClient, Gift, IpEchoClient, MarketClient};
use autobid::config::{AlertConfig, LogConfig};
use autobid::transport::CancelSignal;
use autobid::{AutobidError, Config, ProxyPool, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting autobid");
    info!(
        "Configuration loaded ({} proxies, {} concurrent lookups)",
        config.transport.proxies.len(),
        config.fetch.concurrent_requests
    );
    if config.alert.is_none() {
        warn!("TOKEN not set, alerts disabled");
    }

    // Create shutdown channel; every transport watches it
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cancel = CancelSignal::from_receiver(shutdown_rx);

    let mut options = config.client_options();
    options.cancel = Some(cancel.clone());

    verify_proxies(&config, &options).await?;

    let mut poller = tokio::spawn(poll_loop(config, options, cancel));

    tokio::select! {
        joined = &mut poller => return loop_outcome(joined),
        _ = shutdown_signal() => {}
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    loop_outcome(poller.await)?;

    info!("autobid stopped");
    Ok(())
}

/// Result of the fetch loop task; a panic or abort is an error too
fn loop_outcome(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.unwrap_or_else(|e| {
        error!("Fetch loop aborted: {}", e);
        Err(AutobidError::Request(format!("fetch loop aborted: {}", e)))
    })
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("autobid={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Check every proxy by asking the IP-echo service for its exit address.
/// Any failure is fatal.
async fn verify_proxies(config: &Config, options: &ClientOptions) -> Result<()> {
    let concurrency = config.fetch.concurrent_requests;

    stream::iter(config.transport.proxies.iter().cloned())
        .map(|proxy| {
            let options = options.with_proxies(ProxyPool::new(vec![proxy.clone()]));
            async move {
                let result = async {
                    let mut client = IpEchoClient::connect(&options).await?;
                    client.exit_ip().await
                }
                .await;

                match result {
                    Ok(ip) => {
                        info!("[{}] {}", proxy, ip);
                        Ok(())
                    }
                    Err(e) => {
                        error!("Proxy {} failed verification: {}", proxy, e);
                        Err(e)
                    }
                }
            }
        })
        .buffer_unordered(concurrency)
        .try_collect::<Vec<()>>()
        .await?;

    Ok(())
}

async fn poll_loop(config: Config, options: ClientOptions, cancel: CancelSignal) -> Result<()> {
    let mut market = MarketClient::connect(&options).await?;
    let interval = Duration::from_secs(config.fetch.poll_interval);

    loop {
        match run_cycle(&config, &options, &mut market).await {
            Ok(()) => {}
            Err(AutobidError::Cancelled) => return Ok(()),
            Err(e) => {
                error!("Fetching auctions failed: {}", e);
                return Err(e);
            }
        }

        info!("Waiting {}s for new auctions", interval.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// One page of auctions, then a floor lookup per live auction. Auctions whose
/// bid is under the floor are alerted.
async fn run_cycle(
    config: &Config,
    options: &ClientOptions,
    market: &mut MarketClient,
) -> Result<()> {
    info!("Fetching auctions...");
    let gifts = market
        .auctions(config.first_page(), config.fetch.gifts_per_fetch)
        .await?;

    let now = Utc::now();
    let live: Vec<Gift> = gifts.into_iter().filter(|g| g.is_live(now)).collect();

    let ends = live.iter().filter_map(|g| g.auction_end());
    match (ends.clone().min(), ends.max()) {
        (Some(earliest), Some(latest)) => info!(
            "Found {} auctions ({}s - {}s)",
            live.len(),
            (earliest - now).num_seconds(),
            (latest - now).num_seconds()
        ),
        _ => info!("Found no live auctions"),
    }

    let rare_backdrops = &config.fetch.rare_backdrops;
    let mut lookups = pin!(stream::iter(live)
        .map(|gift| async move {
            let floor = gift_floor(options, &gift, rare_backdrops).await;
            (gift, floor)
        })
        .buffer_unordered(config.fetch.concurrent_requests));

    while let Some((gift, floor)) = lookups.next().await {
        let floor = match floor {
            Ok(floor) => floor,
            Err(AutobidError::Cancelled) => return Err(AutobidError::Cancelled),
            Err(e) => {
                warn!("Floor lookup for gift {} failed: {}", gift.gift_id, e);
                continue;
            }
        };

        let (Some(end), Some(bid)) = (gift.auction_end(), gift.min_bid()) else {
            continue;
        };
        let remaining = end - Utc::now();
        if remaining.num_seconds() <= 0 {
            continue;
        }

        let profit = floor - bid;
        let margin = if floor > 0.0 { 1.0 - bid / floor } else { 0.0 };
        info!(
            "[{}] {} #{} = {:.3} {} | floor {:.3} {} ({:.2}% - {}s left)",
            gift.gift_id,
            gift.name,
            gift.gift_num,
            bid,
            gift.asset,
            floor,
            gift.asset,
            margin * 100.0,
            remaining.num_seconds()
        );

        if profit <= 0.0 {
            continue;
        }
        if let Some(alert) = &config.alert {
            let deal = Deal {
                gift,
                bid,
                floor,
                remaining,
            };
            tokio::spawn(send_alert(
                options.clone(),
                alert.clone(),
                rare_backdrops.clone(),
                deal,
            ));
        }
    }

    Ok(())
}

/// A live auction priced under its collection floor
struct Deal {
    gift: Gift,
    bid: f64,
    floor: f64,
    remaining: chrono::Duration,
}

/// Cheapest listing matching the gift's model, or its backdrop when that
/// backdrop is configured as rare. Falls back to the plain collection floor.
async fn gift_floor(options: &ClientOptions, gift: &Gift, rare_backdrops: &[String]) -> Result<f64> {
    let (model, backdrop) = if is_rare_backdrop(&gift.backdrop, rare_backdrops) {
        (None, Some(gift.backdrop.as_str()))
    } else {
        (Some(gift.model.as_str()), None)
    };

    let mut client = MarketClient::connect(options).await?;
    let cheapest = match client.floor(&gift.name, model, backdrop).await? {
        Some(cheapest) => Some(cheapest),
        None => client.floor(&gift.name, None, None).await?,
    };

    cheapest
        .and_then(|g| g.price)
        .ok_or_else(|| AutobidError::Request(format!("no priced listing for {}", gift.name)))
}

/// Floor on the floor-price service: the model floor, or the backdrop floor
/// for rare backdrops
async fn service_floor(options: &ClientOptions, gift: &Gift, rare_backdrops: &[String]) -> Result<f64> {
    let collection = short_name(&gift.name);
    let mut options = options.clone();
    options.flood.max_flood_retries = 1;

    let mut client = FloorClient::connect(&options).await?;
    let floors = client.floor_prices(&collection).await?;

    if is_rare_backdrop(&gift.backdrop, rare_backdrops) {
        floors.backdrop_floor(&collection, &strip_rarity(&gift.backdrop))
    } else {
        floors.model_floor(&collection, &strip_rarity(&gift.model))
    }
}

async fn send_alert(
    options: ClientOptions,
    alert: AlertConfig,
    rare_backdrops: Vec<String>,
    deal: Deal,
) {
    let second_floor = match service_floor(&options, &deal.gift, &rare_backdrops).await {
        Ok(floor) => Some(floor),
        Err(e) => {
            warn!("[{}] floor service lookup failed: {}", deal.gift.gift_id, e);
            None
        }
    };

    let text = alert_text(&deal, second_floor);
    let sent = async {
        let mut client = AlertClient::connect(&options, &alert.token, alert.chat_id).await?;
        client.send_message(&text).await
    }
    .await;

    if let Err(e) = sent {
        warn!("[{}] alert not delivered: {}", deal.gift.gift_id, e);
    }
}

fn alert_text(deal: &Deal, second_floor: Option<f64>) -> String {
    let gift = &deal.gift;
    let secs = deal.remaining.num_seconds().max(0);

    let mut text = format!(
        "{} #{}\n\nBid: {:.3} {}\nFloor: {:.3} {}\nProfit: {:.3} {}\n",
        gift.name,
        gift.gift_num,
        deal.bid,
        gift.asset,
        deal.floor,
        gift.asset,
        deal.floor - deal.bid,
        gift.asset
    );
    if let Some(floor) = second_floor {
        text.push_str(&format!("Floor service: {:.3} TON\n", floor));
    }
    text.push_str(&format!(
        "Ends in: {:02}:{:02}:{:02}\n\nhttps://t.me/nft/{}-{}",
        secs / 3600,
        secs % 3600 / 60,
        secs % 60,
        short_name(&gift.name),
        gift.gift_num
    ));
    text
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
