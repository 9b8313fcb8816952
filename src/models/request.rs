use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::error::Result;

/// Transient-failure retry budget used when callers do not pick one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Status codes treated as success; everything else is a failure
pub fn is_ok_status(status: u16) -> bool {
    status == 200 || status == 201 || status == 204
}

/// One HTTP request to be framed onto a transport connection.
///
/// Built fresh per call and not retained by the transport.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: Url,
    pub body: Option<Bytes>,
    /// Case-insensitive; `insert` replaces, so the last write wins.
    pub headers: HeaderMap,
    /// Reconnect-and-retry budget for transient connection failures
    pub max_retries: u32,
}

impl RequestSpec {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            headers: HeaderMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Set a header from string parts; replaces any earlier value for the same name
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let value = HeaderValue::from_str(value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Build a header map from string pairs; later pairs override earlier ones
pub fn header_map<'a, I>(pairs: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    Ok(headers)
}

/// A fully buffered HTTP response. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub status: u16,
    pub ok: bool,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseRecord {
    pub fn new(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            ok: is_ok_status(status),
            headers,
            body,
        }
    }

    /// Body decoded as UTF-8, with invalid sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
