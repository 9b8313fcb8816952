//! Chat alerts through the messaging bot API

use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use super::{open, ClientOptions};
use crate::error::{AutobidError, Result};
use crate::transport::FloodControlledRequester;

pub const ALERT_HOST: &str = "api.telegram.org";

const TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Error body sent with a 429; `retry_after` is in whole seconds
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiError {
    parameters: ApiErrorParameters,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiErrorParameters {
    retry_after: u64,
}

fn retry_after(body: &[u8]) -> Option<Duration> {
    serde_json::from_slice::<ApiError>(body)
        .ok()
        .map(|err| err.parameters.retry_after)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Posts text messages to one chat
pub struct AlertClient {
    requester: FloodControlledRequester,
    url: Url,
    chat_id: i64,
}

impl AlertClient {
    pub async fn connect(options: &ClientOptions, token: &str, chat_id: i64) -> Result<Self> {
        let url = Url::parse(&format!("https://{}/bot{}/sendMessage", ALERT_HOST, token))?;
        Ok(Self {
            requester: open(ALERT_HOST, options).await?,
            url,
            chat_id,
        })
    }

    /// Post `text` to the chat.
    ///
    /// The bot API reports its own backoff. A 429 carrying `retry_after` is
    /// waited out once; a second 429, or one without a hint, fails with
    /// [`AutobidError::FloodWait`].
    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        let payload = serde_json::to_vec(&SendMessage {
            chat_id: self.chat_id,
            text,
            disable_web_page_preview: true,
        })?;
        let payload = Bytes::from(payload);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut waited = false;
        loop {
            let response = self
                .requester
                .send(Method::POST, self.url.clone(), Some(payload.clone()), headers.clone())
                .await?;
            if response.ok {
                return Ok(());
            }

            if response.status != TOO_MANY_REQUESTS {
                return Err(AutobidError::Status {
                    status: response.status,
                    body: response.text(),
                });
            }

            match retry_after(&response.body) {
                Some(wait) if !waited => {
                    info!("Alert flood wait, retrying after {}s", wait.as_secs());
                    waited = true;
                    self.requester.pause(wait).await?;
                }
                hint => {
                    return Err(AutobidError::FloodWait {
                        status_code: TOO_MANY_REQUESTS,
                        retry_after_seconds: hint.map(|w| w.as_secs_f64()).unwrap_or_default(),
                        origin: self.requester.origin().to_string(),
                    });
                }
            }
        }
    }
}
