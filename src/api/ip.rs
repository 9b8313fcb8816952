//! Exit-address echo client, used to check that a proxy actually works

use http::{HeaderMap, Method};
use url::Url;

use super::{open, ClientOptions};
use crate::error::Result;
use crate::transport::FloodControlledRequester;

pub const IP_ECHO_HOST: &str = "api.ipify.org";

pub struct IpEchoClient {
    requester: FloodControlledRequester,
    url: Url,
}

impl IpEchoClient {
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        Ok(Self {
            requester: open(IP_ECHO_HOST, options).await?,
            url: Url::parse("https://api.ipify.org/")?,
        })
    }

    /// Public address the service sees this client connecting from
    pub async fn exit_ip(&mut self) -> Result<String> {
        let response = self
            .requester
            .call(Method::GET, self.url.clone(), None, HeaderMap::new())
            .await?;
        Ok(response.text().trim().to_string())
    }
}
