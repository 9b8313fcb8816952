//! Rate-limit (HTTP 429) backoff around a transport

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use tracing::{info, warn};
use url::Url;

use super::cancel::CancelSignal;
use super::client::TlsTransport;
use crate::error::{AutobidError, Result};
use crate::models::{RequestSpec, ResponseRecord, DEFAULT_MAX_RETRIES};

pub const DEFAULT_FLOOD_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_FLOOD_RETRIES: u32 = 3;

const TOO_MANY_REQUESTS: u16 = 429;

/// Flood-wait limits for one requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloodPolicy {
    /// 429 responses tolerated per call before giving up
    pub max_flood_retries: u32,
    /// First backoff; doubles after every 429
    pub base_wait: Duration,
    /// Reconnect budget handed to the transport on every attempt
    pub transient_retries: u32,
}

impl Default for FloodPolicy {
    fn default() -> Self {
        Self {
            max_flood_retries: DEFAULT_FLOOD_RETRIES,
            base_wait: DEFAULT_FLOOD_WAIT,
            transient_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What to do after a 429
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodStep {
    Wait(Duration),
    Exhausted { retry_after: Duration },
}

/// Backoff bookkeeping for one logical call
#[derive(Debug, Clone)]
pub struct RetryState {
    backoff: Duration,
    count: u32,
    max: u32,
}

impl RetryState {
    pub fn new(base: Duration, max: u32) -> Self {
        Self {
            backoff: base,
            count: 0,
            max,
        }
    }

    pub fn from_policy(policy: &FloodPolicy) -> Self {
        Self::new(policy.base_wait, policy.max_flood_retries)
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Record one 429. Yields the wait to apply, or the final backoff once the
    /// budget is spent. `count` never passes `max`.
    pub fn register_flood_wait(&mut self) -> FloodStep {
        if self.count >= self.max {
            return FloodStep::Exhausted {
                retry_after: self.backoff,
            };
        }
        let wait = self.backoff;
        self.count += 1;
        self.backoff = self.backoff.saturating_mul(2);
        FloodStep::Wait(wait)
    }
}

/// Sleep abstraction so backoff can be observed without real delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A transport plus the 429 retry policy of one API origin
pub struct FloodControlledRequester {
    transport: TlsTransport,
    policy: FloodPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancelSignal>,
    origin: String,
}

impl FloodControlledRequester {
    pub fn new(transport: TlsTransport, policy: FloodPolicy) -> Self {
        let origin = transport.host().to_string();
        Self {
            transport,
            policy,
            sleeper: Arc::new(TokioSleeper),
            cancel: None,
            origin,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn policy(&self) -> &FloodPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &TlsTransport {
        &self.transport
    }

    /// Send a request, sleeping through 429s with doubling backoff.
    ///
    /// Returns the first 200/201/204 response. Any other status fails with
    /// [`AutobidError::Status`]; too many 429s fail with
    /// [`AutobidError::FloodWait`].
    pub async fn call(
        &mut self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
        headers: HeaderMap,
    ) -> Result<ResponseRecord> {
        let spec = self.spec(method, url, body, headers);

        let mut state = RetryState::from_policy(&self.policy);
        loop {
            let response = self.transport.request(&spec).await?;
            if response.ok {
                return Ok(response);
            }

            if response.status != TOO_MANY_REQUESTS {
                return Err(AutobidError::Status {
                    status: response.status,
                    body: response.text(),
                });
            }

            match state.register_flood_wait() {
                FloodStep::Wait(wait) => {
                    info!(
                        "{} returned 429, waiting for {}s (flood wait {}/{})",
                        self.origin,
                        wait.as_secs_f64(),
                        state.count(),
                        self.policy.max_flood_retries
                    );
                    self.pause(wait).await?;
                }
                FloodStep::Exhausted { retry_after } => {
                    warn!(
                        "{} still rate limited after {} flood waits",
                        self.origin,
                        state.count()
                    );
                    return Err(AutobidError::FloodWait {
                        status_code: TOO_MANY_REQUESTS,
                        retry_after_seconds: retry_after.as_secs_f64(),
                        origin: self.origin.clone(),
                    });
                }
            }
        }
    }

    /// One request with no status handling, for origins that signal their
    /// own backoff in the response body
    pub async fn send(
        &mut self,
        method: Method,
        url: Url,
        body: Option<Bytes>,
        headers: HeaderMap,
    ) -> Result<ResponseRecord> {
        let spec = self.spec(method, url, body, headers);
        self.transport.request(&spec).await
    }

    fn spec(&self, method: Method, url: Url, body: Option<Bytes>, headers: HeaderMap) -> RequestSpec {
        let mut spec = RequestSpec::new(method, url)
            .headers(headers)
            .max_retries(self.policy.transient_retries);
        spec.body = body;
        spec
    }

    /// Sleep for `wait` unless cancelled first
    pub async fn pause(&self, wait: Duration) -> Result<()> {
        match &self.cancel {
            Some(cancel) => {
                cancel.check()?;
                tokio::select! {
                    _ = self.sleeper.sleep(wait) => Ok(()),
                    _ = cancel.cancelled() => Err(AutobidError::Cancelled),
                }
            }
            None => {
                self.sleeper.sleep(wait).await;
                Ok(())
            }
        }
    }
}
