//! Single-connection HTTP/1.1-over-TLS client with reconnect-and-retry

use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

use super::cancel::CancelSignal;
use super::codec::{self, RawResponse, ReadError};
use super::connector::{ByteStream, Connector, Dialer, DEFAULT_CONNECT_TIMEOUT};
use super::pool::ProxyPool;
use super::tls::TlsMode;
use crate::error::{AutobidError, Result};
use crate::models::{ProxyEndpoint, RequestSpec, ResponseRecord};

pub const DEFAULT_PORT: u16 = 443;

/// Budget for one write + read exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/117.0.0.0 Safari/537.36";

/// Headers sent with every request unless the caller overrides them
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

/// Caller headers replace defaults of the same name; everything else is kept
pub fn merge_headers(defaults: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = defaults.clone();
    for name in overrides.keys() {
        merged.remove(name);
    }
    for (name, value) in overrides.iter() {
        merged.append(name.clone(), value.clone());
    }
    merged
}

/// Whether a write failure means the peer has gone away and a fresh
/// connection is worth trying
pub fn is_connection_aborted(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    ) {
        return true;
    }

    let message = err.to_string().to_ascii_lowercase();
    message.contains("wsasend")
        || message.contains("connection was aborted")
        || message.contains("broken pipe")
}

/// One live encrypted stream to a fixed host.
///
/// The buffered reader lives as long as the stream so read-ahead bytes are
/// never lost between responses.
pub struct Connection {
    host: String,
    mode: TlsMode,
    proxy: Option<Arc<ProxyEndpoint>>,
    reader: BufReader<Box<dyn ByteStream>>,
}

impl Connection {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_deref()
    }

    async fn round_trip(&mut self, wire: &[u8], method: &Method) -> std::result::Result<RawResponse, Failure> {
        let stream = self.reader.get_mut();
        if let Err(e) = write_request(stream, wire).await {
            return Err(if is_connection_aborted(&e) {
                Failure::Transient(format!("write failed: {}", e))
            } else {
                Failure::Fatal(AutobidError::Request(format!("write failed: {}", e)))
            });
        }

        match codec::read_response(&mut self.reader, method).await {
            Ok(response) => Ok(response),
            Err(ReadError::Closed { partial: false }) => {
                debug!("{} closed the connection before responding", self.host);
                Err(Failure::Transient("connection closed by peer".to_string()))
            }
            Err(ReadError::Closed { partial: true }) => {
                info!("{} closed the connection mid-response", self.host);
                Err(Failure::Transient("connection closed mid-response".to_string()))
            }
            Err(ReadError::Io(e)) => Err(Failure::Fatal(AutobidError::Request(format!(
                "read failed: {}",
                e
            )))),
            Err(e @ ReadError::Malformed(_)) => {
                Err(Failure::Fatal(AutobidError::Request(e.to_string())))
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("mode", &self.mode)
            .field("proxy", &self.proxy.as_ref().map(|p| p.to_string()))
            .finish()
    }
}

async fn write_request(stream: &mut Box<dyn ByteStream>, wire: &[u8]) -> io::Result<()> {
    stream.write_all(wire).await?;
    stream.flush().await
}

/// Outcome of one exchange that did not produce a response
enum Failure {
    /// Reconnect and try again
    Transient(String),
    Fatal(AutobidError),
}

/// Settings for a [`TlsTransport`]
#[derive(Clone)]
pub struct TransportOptions {
    pub tls_mode: TlsMode,
    /// Dial a new connection for every request instead of reusing one
    pub force_reconnect: bool,
    pub proxies: ProxyPool,
    pub default_headers: HeaderMap,
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub cancel: Option<CancelSignal>,
    /// Replaces the rustls [`Connector`]; `tls_mode` and `connect_timeout`
    /// are then up to the supplied dialer
    pub dialer: Option<Arc<dyn Dialer>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tls_mode: TlsMode::Verify,
            force_reconnect: false,
            proxies: ProxyPool::direct(),
            default_headers: default_headers(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cancel: None,
            dialer: None,
        }
    }
}

/// Owns at most one connection to a single host and frames requests over it.
///
/// `request` borrows the transport mutably, so one transport serves one call
/// at a time. Run several transports for parallelism.
pub struct TlsTransport {
    host: String,
    port: u16,
    mode: TlsMode,
    force_reconnect: bool,
    default_headers: HeaderMap,
    proxies: ProxyPool,
    dialer: Arc<dyn Dialer>,
    request_timeout: Duration,
    cancel: Option<CancelSignal>,
    conn: Option<Connection>,
}

impl TlsTransport {
    /// Build a transport for `host`. Unless `force_reconnect` is set the first
    /// connection is dialed here and a failure is returned immediately.
    #[instrument(skip(options))]
    pub async fn connect(host: &str, options: TransportOptions) -> Result<Self> {
        let host = host.to_string();
        if host.is_empty() {
            return Err(AutobidError::InvalidRequest("transport host is empty".to_string()));
        }

        let dialer: Arc<dyn Dialer> = match options.dialer {
            Some(dialer) => dialer,
            None => Arc::new(
                Connector::new(options.tls_mode)?.with_connect_timeout(options.connect_timeout),
            ),
        };

        let mut transport = Self {
            host,
            port: options.port,
            mode: options.tls_mode,
            force_reconnect: options.force_reconnect,
            default_headers: options.default_headers,
            proxies: options.proxies,
            dialer,
            request_timeout: options.request_timeout,
            cancel: options.cancel,
            conn: None,
        };

        if !transport.force_reconnect {
            transport.reconnect().await?;
        }

        Ok(transport)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    /// Drop the current connection, if any; the next request redials
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Replace the current connection with a freshly dialed one
    async fn reconnect(&mut self) -> Result<()> {
        self.check_cancelled()?;
        self.conn = None;

        let proxy = self.proxies.pick();
        match &proxy {
            Some(p) => debug!("Connecting to {}:{} via {}", self.host, self.port, p),
            None => debug!("Connecting to {}:{} directly", self.host, self.port),
        }

        let stream = self
            .dialer
            .dial(&self.host, self.port, proxy.as_deref())
            .await?;

        self.conn = Some(Connection {
            host: self.host.clone(),
            mode: self.mode,
            proxy,
            reader: BufReader::new(stream),
        });
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(cancel) => cancel.check(),
            None => Ok(()),
        }
    }

    /// Send `spec` and return the complete response, whatever its status.
    ///
    /// Transient connection failures reconnect through a fresh proxy draw and
    /// retry up to `spec.max_retries` times. Dial failures, timeouts and
    /// protocol errors are returned as-is.
    #[instrument(skip(self, spec), fields(host = %self.host, method = %spec.method, path = spec.url.path()))]
    pub async fn request(&mut self, spec: &RequestSpec) -> Result<ResponseRecord> {
        let headers = merge_headers(&self.default_headers, &spec.headers);
        let wire = codec::encode_request(&spec.method, &spec.url, &headers, spec.body.as_deref())?;

        if self.force_reconnect || self.conn.is_none() {
            self.reconnect().await?;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.exchange(&wire, &spec.method).await {
                Ok(response) => {
                    if response.close {
                        debug!("Server ended keep-alive, dropping connection");
                        self.conn = None;
                    }
                    return Ok(ResponseRecord::new(
                        response.status,
                        response.headers,
                        response.body,
                    ));
                }
                Err(Failure::Transient(reason)) => {
                    if attempt >= spec.max_retries {
                        warn!(
                            "Giving up on {} {} after {} attempts: {}",
                            spec.method,
                            spec.url,
                            attempt + 1,
                            reason
                        );
                        self.conn = None;
                        return Err(AutobidError::MaxRetriesExceeded {
                            attempts: attempt + 1,
                        });
                    }
                    attempt += 1;
                    info!(
                        attempt,
                        max_retries = spec.max_retries,
                        reason = %reason,
                        "reconnect requested"
                    );
                    self.reconnect().await?;
                }
                Err(Failure::Fatal(err)) => {
                    self.conn = None;
                    return Err(err);
                }
            }
        }
    }

    async fn exchange(&mut self, wire: &[u8], method: &Method) -> std::result::Result<RawResponse, Failure> {
        self.check_cancelled().map_err(Failure::Fatal)?;

        let timeout = self.request_timeout;
        let cancel = self.cancel.clone();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Failure::Fatal(AutobidError::Request("no open connection".to_string())))?;

        let exchange = tokio::time::timeout(timeout, conn.round_trip(wire, method));
        let result = match cancel {
            Some(cancel) => tokio::select! {
                result = exchange => result,
                _ = cancel.cancelled() => return Err(Failure::Fatal(AutobidError::Cancelled)),
            },
            None => exchange.await,
        };

        result.map_err(|_| {
            Failure::Fatal(AutobidError::Timeout {
                seconds: timeout.as_secs(),
            })
        })?
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("force_reconnect", &self.force_reconnect)
            .field("proxies", &self.proxies.len())
            .field("conn", &self.conn)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::cancel::CancelHandle;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use url::Url;

    /// What one dialed connection will do
    #[derive(Debug, Clone, Default)]
    pub(crate) struct Script {
        pub response: Vec<u8>,
        pub write_error: Option<io::ErrorKind>,
        pub hang: bool,
    }

    impl Script {
        pub fn respond(raw: &[u8]) -> Self {
            Self {
                response: raw.to_vec(),
                ..Default::default()
            }
        }

        pub fn status(status: u16, body: &str) -> Self {
            Self::respond(
                format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                )
                .as_bytes(),
            )
        }

        pub fn write_fails(kind: io::ErrorKind) -> Self {
            Self {
                write_error: Some(kind),
                ..Default::default()
            }
        }

        pub fn hang() -> Self {
            Self {
                hang: true,
                ..Default::default()
            }
        }
    }

    struct ScriptedStream {
        response: io::Cursor<Vec<u8>>,
        write_error: Option<io::ErrorKind>,
        hang: bool,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncRead for ScriptedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.hang {
                return Poll::Pending;
            }
            let pos = self.response.position() as usize;
            let data = self.response.get_ref();
            let n = (data.len() - pos).min(buf.remaining());
            buf.put_slice(&data[pos..pos + n]);
            self.response.set_position((pos + n) as u64);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ScriptedStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if let Some(kind) = self.write_error.take() {
                return Poll::Ready(Err(io::Error::new(kind, "scripted write failure")));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Hands out scripted streams in order and counts dials
    #[derive(Default)]
    pub(crate) struct MockDialer {
        scripts: Mutex<VecDeque<Script>>,
        dials: AtomicUsize,
        proxies_seen: Mutex<Vec<Option<String>>>,
        cancel_on_dial: Mutex<Option<(usize, CancelHandle)>>,
        pub written: Arc<Mutex<Vec<u8>>>,
    }

    impl MockDialer {
        pub fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }

        /// Fire `handle` while serving dial number `nth` (1-based)
        pub fn cancelling_on_dial(scripts: Vec<Script>, nth: usize, handle: CancelHandle) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                cancel_on_dial: Mutex::new(Some((nth, handle))),
                ..Default::default()
            })
        }

        pub fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        pub fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(
            &self,
            _host: &str,
            _port: u16,
            proxy: Option<&ProxyEndpoint>,
        ) -> Result<Box<dyn ByteStream>> {
            let dial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((nth, handle)) = self.cancel_on_dial.lock().unwrap().as_ref() {
                if *nth == dial {
                    handle.cancel();
                }
            }
            self.proxies_seen
                .lock()
                .unwrap()
                .push(proxy.map(|p| p.host.clone()));

            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AutobidError::Connect("no scripted connection left".to_string()))?;

            Ok(Box::new(ScriptedStream {
                response: io::Cursor::new(script.response),
                write_error: script.write_error,
                hang: script.hang,
                written: self.written.clone(),
            }))
        }
    }

    pub(crate) fn options_with(dialer: Arc<MockDialer>) -> TransportOptions {
        TransportOptions {
            dialer: Some(dialer as Arc<dyn Dialer>),
            ..Default::default()
        }
    }

    fn get(path: &str) -> RequestSpec {
        RequestSpec::get(Url::parse(&format!("https://api.example{}", path)).unwrap())
    }

    #[tokio::test]
    async fn reuses_one_connection_across_requests() {
        let mut both = Script::status(200, "one").response;
        both.extend(Script::status(201, "two").response);
        let dialer = MockDialer::new(vec![Script::respond(&both)]);

        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();
        assert_eq!(dialer.dials(), 1);

        let first = transport.request(&get("/a")).await.unwrap();
        let second = transport.request(&get("/b")).await.unwrap();

        assert_eq!((first.status, first.text()), (200, "one".to_string()));
        assert_eq!((second.status, second.text()), (201, "two".to_string()));
        assert!(second.ok);
        assert_eq!(dialer.dials(), 1);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn force_reconnect_dials_for_every_request() {
        let dialer = MockDialer::new(vec![Script::status(200, "a"), Script::status(200, "b")]);
        let options = TransportOptions {
            force_reconnect: true,
            ..options_with(dialer.clone())
        };

        let mut transport = TlsTransport::connect("api.example", options).await.unwrap();
        assert_eq!(dialer.dials(), 0);
        assert!(!transport.is_connected());

        transport.request(&get("/")).await.unwrap();
        transport.request(&get("/")).await.unwrap();
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn transient_write_failure_reconnects_once() {
        let dialer = MockDialer::new(vec![
            Script::write_fails(io::ErrorKind::BrokenPipe),
            Script::status(200, "ok"),
        ]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let response = transport.request(&get("/").max_retries(1)).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn zero_retries_fails_without_reconnecting() {
        let dialer = MockDialer::new(vec![
            Script::write_fails(io::ErrorKind::ConnectionReset),
            Script::status(200, "unused"),
        ]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let err = transport.request(&get("/").max_retries(0)).await.unwrap_err();
        assert!(matches!(err, AutobidError::MaxRetriesExceeded { attempts: 1 }));
        assert_eq!(err.to_string(), "max retries exceeded");
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn eof_before_response_is_retried() {
        let dialer = MockDialer::new(vec![Script::respond(b""), Script::status(204, "")]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let response = transport.request(&get("/")).await.unwrap();
        assert_eq!(response.status, 204);
        assert!(response.ok);
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn retries_stop_at_budget() {
        let dialer = MockDialer::new(vec![
            Script::respond(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\ncut"),
            Script::respond(b""),
            Script::respond(b""),
            Script::status(200, "unused"),
        ]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let err = transport.request(&get("/").max_retries(2)).await.unwrap_err();
        assert!(matches!(err, AutobidError::MaxRetriesExceeded { attempts: 3 }));
        assert_eq!(dialer.dials(), 3);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn malformed_response_is_fatal_and_next_call_redials() {
        let dialer = MockDialer::new(vec![
            Script::respond(b"SSH-2.0-OpenSSH_9.6\r\n"),
            Script::status(200, "fine"),
        ]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let err = transport.request(&get("/")).await.unwrap_err();
        assert!(matches!(err, AutobidError::Request(_)));
        assert_eq!(dialer.dials(), 1);
        assert!(!transport.is_connected());

        let response = transport.request(&get("/")).await.unwrap();
        assert_eq!(response.text(), "fine");
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn non_transient_write_error_is_fatal() {
        let dialer = MockDialer::new(vec![
            Script::write_fails(io::ErrorKind::PermissionDenied),
            Script::status(200, "unused"),
        ]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let err = transport.request(&get("/")).await.unwrap_err();
        assert!(matches!(err, AutobidError::Request(_)));
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn connection_close_response_drops_connection() {
        let dialer = MockDialer::new(vec![
            Script::respond(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok"),
            Script::status(200, "again"),
        ]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        transport.request(&get("/")).await.unwrap();
        assert!(!transport.is_connected());

        let response = transport.request(&get("/")).await.unwrap();
        assert_eq!(response.text(), "again");
        assert_eq!(dialer.dials(), 2);
    }

    #[tokio::test]
    async fn non_success_status_is_a_response_not_an_error() {
        let dialer = MockDialer::new(vec![Script::status(404, "missing")]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let response = transport.request(&get("/")).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.ok);
        assert_eq!(response.text(), "missing");
    }

    #[tokio::test]
    async fn dial_failure_during_request_is_not_retried() {
        let dialer = MockDialer::new(vec![]);
        let options = TransportOptions {
            force_reconnect: true,
            ..options_with(dialer.clone())
        };
        let mut transport = TlsTransport::connect("api.example", options).await.unwrap();

        let err = transport.request(&get("/")).await.unwrap_err();
        assert!(err.is_connect_error());
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn connect_failure_surfaces_from_constructor() {
        let dialer = MockDialer::new(vec![]);
        let err = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap_err();
        assert!(err.is_connect_error());
    }

    #[tokio::test]
    async fn cancelled_before_dial_never_dials() {
        let dialer = MockDialer::new(vec![Script::status(200, "unused")]);
        let handle = CancelHandle::new();
        handle.cancel();
        let options = TransportOptions {
            cancel: Some(handle.signal()),
            ..options_with(dialer.clone())
        };

        let err = TlsTransport::connect("api.example", options).await.unwrap_err();
        assert!(matches!(err, AutobidError::Cancelled));
        assert_eq!(dialer.dials(), 0);
    }

    #[tokio::test]
    async fn cancel_during_redial_stops_before_next_write() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let dialer = MockDialer::cancelling_on_dial(
            vec![
                Script::write_fails(io::ErrorKind::BrokenPipe),
                Script::status(200, "unused"),
            ],
            2,
            handle,
        );
        let options = TransportOptions {
            cancel: Some(signal),
            ..options_with(dialer.clone())
        };
        let mut transport = TlsTransport::connect("api.example", options).await.unwrap();

        let err = transport.request(&get("/").max_retries(3)).await.unwrap_err();
        assert!(matches!(err, AutobidError::Cancelled));
        assert_eq!(dialer.dials(), 2);
        assert!(dialer.written().is_empty());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn slow_server_hits_request_timeout() {
        let dialer = MockDialer::new(vec![Script::hang()]);
        let options = TransportOptions {
            request_timeout: Duration::from_millis(50),
            ..options_with(dialer.clone())
        };
        let mut transport = TlsTransport::connect("api.example", options).await.unwrap();

        let err = transport.request(&get("/")).await.unwrap_err();
        assert!(matches!(err, AutobidError::Timeout { .. }));
        assert_eq!(dialer.dials(), 1);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn request_body_reaches_the_wire_unmodified() {
        let body: Vec<u8> = (0..=255u8).rev().collect();
        let dialer = MockDialer::new(vec![Script::status(200, "")]);
        let mut transport = TlsTransport::connect("api.example", options_with(dialer.clone()))
            .await
            .unwrap();

        let spec = RequestSpec::post(Url::parse("https://api.example/upload?x=1").unwrap())
            .body(body.clone())
            .header("User-Agent", "custom/1.0")
            .unwrap();
        transport.request(&spec).await.unwrap();

        let written = dialer.written();
        let split = written.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        let head = std::str::from_utf8(&written[..split]).unwrap();

        assert!(head.starts_with("POST /upload?x=1 HTTP/1.1\r\n"));
        assert!(head.contains("user-agent: custom/1.0"));
        assert!(!head.contains("Chrome"));
        assert!(head.contains("connection: keep-alive"));
        assert!(head.contains("content-length: 256"));
        assert_eq!(&written[split + 4..], &body[..]);
    }

    #[tokio::test]
    async fn every_dial_draws_from_the_pool() {
        let dialer = MockDialer::new(vec![
            Script::write_fails(io::ErrorKind::BrokenPipe),
            Script::status(200, "ok"),
        ]);
        let options = TransportOptions {
            proxies: ProxyPool::from_urls(&["socks5://10.1.1.1:1080"]).unwrap(),
            ..options_with(dialer.clone())
        };
        let mut transport = TlsTransport::connect("api.example", options).await.unwrap();
        transport.request(&get("/")).await.unwrap();

        let seen = dialer.proxies_seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some("10.1.1.1".to_string()); 2]);
        assert_eq!(
            transport.connection().and_then(|c| c.proxy()).map(|p| p.port),
            Some(1080)
        );
    }

    #[test]
    fn merge_headers_caller_wins() {
        let mut overrides = HeaderMap::new();
        overrides.insert(CONNECTION, HeaderValue::from_static("close"));
        overrides.insert("x-extra", HeaderValue::from_static("1"));

        let merged = merge_headers(&default_headers(), &overrides);
        assert_eq!(merged[CONNECTION], "close");
        assert_eq!(merged.get_all(CONNECTION).iter().count(), 1);
        assert_eq!(merged[USER_AGENT], DEFAULT_USER_AGENT);
        assert_eq!(merged["x-extra"], "1");
    }

    #[test]
    fn connection_aborted_classification() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected,
            io::ErrorKind::WriteZero,
        ] {
            assert!(is_connection_aborted(&io::Error::new(kind, "x")), "{:?}", kind);
        }

        let text = |msg: &str| io::Error::new(io::ErrorKind::Other, msg.to_string());
        assert!(is_connection_aborted(&text("write tcp: wsasend: An established connection was aborted")));
        assert!(is_connection_aborted(&text("Broken Pipe")));
        assert!(!is_connection_aborted(&text("certificate expired")));
        assert!(!is_connection_aborted(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }
}
