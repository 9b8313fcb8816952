//! HTTP/1.1 framing over a raw byte stream
//!
//! Two independent stages: [`encode_request`] turns a request into the exact
//! bytes written to the socket, and [`read_response`] parses one response from
//! a buffered reader. Neither touches the network directly.

use std::io;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::Url;

use crate::error::{AutobidError, Result};

/// Upper bound on the status line plus header section of one response
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a decoded response body, whatever its framing
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on a single chunk-size or trailer line
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Serialize a request into wire bytes.
///
/// `headers` should already contain the merged default and caller headers.
/// `host` and `content-length` are derived from the URL and body; a caller
/// supplied `host` wins, a caller supplied `content-length` is ignored. The
/// body is appended verbatim.
pub fn encode_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let host = url
        .host_str()
        .ok_or_else(|| AutobidError::InvalidRequest(format!("URL '{}' has no host", url)))?;

    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    let mut out = Vec::with_capacity(256 + body_len);

    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", method.as_str(), target).as_bytes());

    if !headers.contains_key(HOST) {
        let host_value = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        write_header(&mut out, HOST.as_str(), host_value.as_bytes());
    }

    for (name, value) in headers.iter() {
        if name == CONTENT_LENGTH {
            continue;
        }
        write_header(&mut out, name.as_str(), value.as_bytes());
    }

    let needs_length = body.is_some()
        || matches!(*method, Method::POST | Method::PUT | Method::PATCH);
    if needs_length {
        write_header(&mut out, CONTENT_LENGTH.as_str(), body_len.to_string().as_bytes());
    }

    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }

    Ok(out)
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// A response parsed off the wire
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The connection cannot carry another request after this response
    pub close: bool,
}

/// Why a response could not be read
#[derive(Debug)]
pub enum ReadError {
    /// The stream ended before a complete response. `partial` is false when
    /// not a single byte of the response had arrived.
    Closed { partial: bool },
    Io(io::Error),
    Malformed(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Closed { partial: false } => write!(f, "connection closed by peer"),
            ReadError::Closed { partial: true } => {
                write!(f, "connection closed mid-response")
            }
            ReadError::Io(e) => write!(f, "{}", e),
            ReadError::Malformed(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

impl ReadError {
    fn from_io(err: io::Error, partial: bool) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ReadError::Closed { partial }
        } else {
            ReadError::Io(err)
        }
    }
}

/// Parse one response for a request sent with `method`.
///
/// Interim 1xx responses are skipped. Body framing follows RFC 9112: no body
/// for HEAD, 1xx, 204 and 304; chunked transfer coding; content-length;
/// otherwise everything up to end of stream.
pub async fn read_response<R>(
    reader: &mut R,
    method: &Method,
) -> std::result::Result<RawResponse, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut started = false;

    loop {
        let mut budget = MAX_HEAD_BYTES;

        let line = match read_line(reader, &mut budget).await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(ReadError::Closed { partial: started }),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ReadError::Malformed(e.to_string()));
            }
            // Part of the status line arrived before the stream ended.
            Err(e) => return Err(ReadError::from_io(e, true)),
        };
        started = true;

        let (version, status, reason) = parse_status_line(&line)?;
        let headers = read_headers(reader, &mut budget).await?;

        if (100..200).contains(&status) {
            // 101 would switch protocols; nothing here asks for it.
            if status == 101 {
                return Err(ReadError::Malformed("unexpected 101 Switching Protocols".into()));
            }
            continue;
        }

        let mut close = wants_close(&version, &headers);

        let body = if *method == Method::HEAD || status == 204 || status == 304 {
            Bytes::new()
        } else if is_chunked(&headers) {
            read_chunked(reader).await?
        } else if let Some(len) = content_length(&headers)? {
            if len > MAX_BODY_BYTES {
                return Err(ReadError::Malformed(format!(
                    "content-length {} exceeds {} byte limit",
                    len, MAX_BODY_BYTES
                )));
            }
            let mut body = Vec::new();
            read_exactly(reader, len, &mut body).await?;
            Bytes::from(body)
        } else {
            close = true;
            let mut body = Vec::new();
            (&mut *reader)
                .take(MAX_BODY_BYTES as u64 + 1)
                .read_to_end(&mut body)
                .await
                .map_err(|e| ReadError::from_io(e, true))?;
            if body.len() > MAX_BODY_BYTES {
                return Err(ReadError::Malformed(format!(
                    "body exceeds {} byte limit",
                    MAX_BODY_BYTES
                )));
            }
            Bytes::from(body)
        };

        return Ok(RawResponse {
            status,
            reason,
            headers,
            body,
            close,
        });
    }
}

/// Read one `\n`-terminated line (terminator stripped), charging it to `budget`.
/// `Ok(None)` means the stream was already at EOF.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (*budget).min(MAX_HEAD_BYTES) as u64;
    if limit == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "header section too large"));
    }
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await;
    let n = match read {
        Ok(n) => n,
        // TLS streams report a missing close_notify as UnexpectedEof.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && buf.is_empty() => 0,
        Err(e) => return Err(e),
    };

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if n as u64 == limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream ended mid-line",
        ));
    }
    *budget -= n;

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "line is not valid UTF-8"))
}

/// Like [`read_line`] but EOF is an error, since a response is already underway
async fn read_required_line<R>(
    reader: &mut R,
    budget: &mut usize,
) -> std::result::Result<String, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader, budget).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(ReadError::Closed { partial: true }),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            Err(ReadError::Malformed(e.to_string()))
        }
        Err(e) => Err(ReadError::from_io(e, true)),
    }
}

fn parse_status_line(line: &str) -> std::result::Result<(String, u16, String), ReadError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    let reason = parts.next().unwrap_or_default();

    if !version.starts_with("HTTP/1.") {
        return Err(ReadError::Malformed(format!("bad status line: {:?}", line)));
    }
    if code.len() != 3 {
        return Err(ReadError::Malformed(format!("bad status code: {:?}", code)));
    }
    let status = code
        .parse::<u16>()
        .map_err(|_| ReadError::Malformed(format!("bad status code: {:?}", code)))?;

    Ok((version.to_string(), status, reason.to_string()))
}

async fn read_headers<R>(
    reader: &mut R,
    budget: &mut usize,
) -> std::result::Result<HeaderMap, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();

    loop {
        let line = read_required_line(reader, budget).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ReadError::Malformed("obsolete header folding".into()));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ReadError::Malformed(format!("bad header line: {:?}", line)))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ReadError::Malformed(format!("bad header name: {:?}", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| ReadError::Malformed(format!("bad value for header {}", name)))?;
        headers.append(name, value);
    }
}

fn wants_close(version: &str, headers: &HeaderMap) -> bool {
    let tokens: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();

    if tokens.iter().any(|t| t == "close") {
        return true;
    }
    version == "HTTP/1.0" && !tokens.iter().any(|t| t == "keep-alive")
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> std::result::Result<Option<usize>, ReadError> {
    let mut length: Option<usize> = None;
    for value in headers.get_all(CONTENT_LENGTH).iter() {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| ReadError::Malformed("bad content-length".into()))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ReadError::Malformed("conflicting content-length".into()));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

async fn read_chunked<R>(reader: &mut R) -> std::result::Result<Bytes, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();

    loop {
        let mut budget = MAX_LINE_BYTES;
        let size_line = read_required_line(reader, &mut budget).await?;
        let size_str = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ReadError::Malformed(format!("bad chunk size: {:?}", size_str)))?;

        if size == 0 {
            // Trailer section, discarded.
            let mut budget = MAX_HEAD_BYTES;
            while !read_required_line(reader, &mut budget).await?.is_empty() {}
            return Ok(Bytes::from(body));
        }

        match body.len().checked_add(size) {
            Some(total) if total <= MAX_BODY_BYTES => {}
            _ => {
                return Err(ReadError::Malformed(format!(
                    "chunked body exceeds {} byte limit",
                    MAX_BODY_BYTES
                )))
            }
        }
        read_exactly(reader, size, &mut body).await?;

        let mut budget = MAX_LINE_BYTES;
        if !read_required_line(reader, &mut budget).await?.is_empty() {
            return Err(ReadError::Malformed("chunk not followed by CRLF".into()));
        }
    }
}

/// Append exactly `len` bytes to `body`, growing it only as data arrives
async fn read_exactly<R>(
    reader: &mut R,
    len: usize,
    body: &mut Vec<u8>,
) -> std::result::Result<(), ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(len as u64)
        .read_to_end(body)
        .await
        .map_err(|e| ReadError::from_io(e, true))?;
    if n < len {
        return Err(ReadError::Closed { partial: true });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn parse(raw: &[u8], method: &Method) -> std::result::Result<RawResponse, ReadError> {
        let mut reader = BufReader::new(raw);
        read_response(&mut reader, method).await
    }

    #[test]
    fn encode_get_without_body() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let bytes = encode_request(
            &Method::GET,
            &url("https://api.example/v1/items?page=2&q=a%20b"),
            &headers,
            None,
        )
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert_eq!(
            text,
            "GET /v1/items?page=2&q=a%20b HTTP/1.1\r\nhost: api.example\r\naccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn encode_post_body_is_byte_identical() {
        let body: Vec<u8> = (0..=255u8).chain(b"\r\n\r\n{\"a\":1}".iter().copied()).collect();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/octet-stream"));
        // Caller supplied length is replaced by the real one.
        headers.insert("content-length", HeaderValue::from_static("1"));

        let bytes = encode_request(
            &Method::POST,
            &url("https://api.example:8443/upload"),
            &headers,
            Some(&body),
        )
        .unwrap();

        let split = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap();
        let head = std::str::from_utf8(&bytes[..split]).unwrap();

        assert!(head.starts_with("POST /upload HTTP/1.1\r\n"));
        assert!(head.contains("host: api.example:8443"));
        assert!(head.contains(&format!("content-length: {}", body.len())));
        assert!(!head.contains("content-length: 1\r"));
        assert_eq!(&bytes[split + 4..], &body[..]);
    }

    #[test]
    fn encode_post_without_body_sends_zero_length() {
        let bytes =
            encode_request(&Method::POST, &url("https://api.example/"), &HeaderMap::new(), None)
                .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("content-length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn encode_respects_caller_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("virtual.example"));
        let bytes =
            encode_request(&Method::GET, &url("https://api.example/"), &headers, None).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.matches("host:").count(), 1);
        assert!(text.contains("host: virtual.example\r\n"));
    }

    #[tokio::test]
    async fn parse_content_length_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let resp = parse(raw, &Method::GET).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.headers["content-type"], "text/plain");
        assert_eq!(&resp.body[..], b"hello");
        assert!(!resp.close);
    }

    #[tokio::test]
    async fn parse_leaves_next_response_in_buffer() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\naHTTP/1.1 404 Not Found\r\nContent-Length: 1\r\n\r\nb";
        let mut reader = BufReader::new(&raw[..]);

        let first = read_response(&mut reader, &Method::GET).await.unwrap();
        let second = read_response(&mut reader, &Method::GET).await.unwrap();

        assert_eq!((first.status, &first.body[..]), (200, &b"a"[..]));
        assert_eq!((second.status, &second.body[..]), (404, &b"b"[..]));
    }

    #[tokio::test]
    async fn parse_chunked_response_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nTransfer-")
            .read(b"Encoding: chunked\r\n\r\n5;ext=1\r\nhel")
            .read(b"lo\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n")
            .build();
        let mut reader = BufReader::new(&mut mock);

        let resp = read_response(&mut reader, &Method::GET).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"hello world");
    }

    #[tokio::test]
    async fn parse_eof_delimited_body_marks_close() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n203.0.113.7";
        let resp = parse(raw, &Method::GET).await.unwrap();
        assert_eq!(&resp.body[..], b"203.0.113.7");
        assert!(resp.close);
    }

    #[tokio::test]
    async fn parse_no_body_statuses_and_head() {
        let resp = parse(b"HTTP/1.1 204 No Content\r\n\r\n", &Method::GET)
            .await
            .unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());

        let resp = parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n",
            &Method::HEAD,
        )
        .await
        .unwrap();
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn parse_skips_interim_continue() {
        let raw = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        let resp = parse(raw, &Method::POST).await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(&resp.body[..], b"ok");
    }

    #[tokio::test]
    async fn parse_connection_close_and_http10() {
        let resp = parse(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
            &Method::GET,
        )
        .await
        .unwrap();
        assert!(resp.close);

        let resp = parse(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", &Method::GET)
            .await
            .unwrap();
        assert!(resp.close);

        let resp = parse(
            b"HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: 0\r\n\r\n",
            &Method::GET,
        )
        .await
        .unwrap();
        assert!(!resp.close);
    }

    #[tokio::test]
    async fn parse_empty_stream_is_clean_close() {
        let err = parse(b"", &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Closed { partial: false }));
    }

    #[tokio::test]
    async fn parse_truncated_body_is_partial_close() {
        let err = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc", &Method::GET)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Closed { partial: true }));

        let err = parse(b"HTTP/1.1 200 OK\r\nContent-Le", &Method::GET)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Closed { partial: true }));
    }

    #[tokio::test]
    async fn parse_rejects_garbage() {
        let err = parse(b"SSH-2.0-OpenSSH\r\n\r\n", &Method::GET)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));

        let err = parse(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab",
            &Method::GET,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));

        let err = parse(b"HTTP/1.1 200 OK\r\nX-A: 1\r\n folded\r\n\r\n", &Method::GET)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }

    #[tokio::test]
    async fn parse_rejects_overflowing_chunk_size() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nffffffffffffffff\r\nb\r\n0\r\n\r\n";
        let err = parse(raw, &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }

    #[tokio::test]
    async fn parse_rejects_oversized_bodies() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 9223372036854775808\r\n\r\nab";
        let err = parse(raw, &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));

        let raw = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n",
            MAX_BODY_BYTES + 1
        );
        let err = parse(raw.as_bytes(), &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));

        let mut raw = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        raw.resize(raw.len() + MAX_BODY_BYTES + 1, b'x');
        let err = parse(&raw, &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }

    #[tokio::test]
    async fn parse_tls_eof_before_any_byte_is_clean_close() {
        let mut mock = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed without close_notify"))
            .build();
        let mut reader = BufReader::new(&mut mock);

        let err = read_response(&mut reader, &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Closed { partial: false }));
    }

    #[tokio::test]
    async fn parse_tls_eof_mid_status_line_is_partial() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"HTTP/1.1 20")
            .read_error(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed without close_notify"))
            .build();
        let mut reader = BufReader::new(&mut mock);

        let err = read_response(&mut reader, &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Closed { partial: true }));
    }

    #[tokio::test]
    async fn parse_rejects_oversized_head() {
        let mut raw = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        raw.extend_from_slice(b"\r\n\r\n");

        let err = parse(&raw, &Method::GET).await.unwrap_err();
        assert!(matches!(err, ReadError::Malformed(_)));
    }
}
