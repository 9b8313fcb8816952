//! Resilient TLS transport
//!
//! This module provides the client side plumbing used by every API client:
//! - Random upstream proxy selection
//! - HTTP CONNECT and SOCKS5 tunneling
//! - rustls sessions with strict or skip-verify certificate handling
//! - Manual HTTP/1.1 framing over a single kept-alive connection
//! - Reconnect-and-retry on dropped connections
//! - Flood-wait backoff for rate-limited endpoints

pub mod cancel;
pub mod client;
pub mod codec;
pub mod connector;
pub mod flood;
pub mod pool;
pub mod tls;
pub mod tunnel;

pub use cancel::{CancelHandle, CancelSignal};
pub use client::{default_headers, is_connection_aborted, Connection, TlsTransport, TransportOptions};
pub use connector::{ByteStream, Connector, Dialer};
pub use flood::{FloodControlledRequester, FloodPolicy, RetryState, Sleeper, TokioSleeper};
pub use pool::ProxyPool;
pub use tls::TlsMode;
