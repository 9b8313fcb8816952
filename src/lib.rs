//! Autobid - Resilient TLS transport for marketplace polling
//!
//! A small HTTPS client stack written in Rust.
//!
//! ## Features
//!
//! - One long-lived TLS connection per host, reconnected on dropped connections
//! - Random upstream proxy per connection (HTTP CONNECT, SOCKS5)
//! - Hand-rolled HTTP/1.1 framing with chunked and keep-alive support
//! - Bounded exponential backoff on HTTP 429 responses
//! - Thin marketplace, floor-price and IP-echo clients on top

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod transport;

pub use config::Config;
pub use error::{AutobidError, Result};
pub use transport::{FloodControlledRequester, ProxyPool, TlsTransport, TransportOptions};
