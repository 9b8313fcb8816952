//! Random proxy selection

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::Result;
use crate::models::ProxyEndpoint;

/// Read-only set of upstream proxies.
///
/// Cloning is cheap and clones share the same endpoint list, so one pool can be
/// handed to every transport in the process. An empty pool means "dial directly".
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    proxies: Arc<[Arc<ProxyEndpoint>]>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyEndpoint>) -> Self {
        Self {
            proxies: proxies.into_iter().map(Arc::new).collect(),
        }
    }

    /// A pool with no proxies; every connection is dialed directly.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Parse every URL, failing on the first invalid one
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Self> {
        let proxies = urls
            .iter()
            .map(|u| ProxyEndpoint::parse(u.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(proxies))
    }

    /// Draw one proxy uniformly at random, or `None` when the pool is empty.
    ///
    /// Every call is an independent draw from the thread-local generator, which
    /// is seeded once from OS entropy. A proxy that just failed may be drawn again.
    pub fn pick(&self) -> Option<Arc<ProxyEndpoint>> {
        self.pick_with(&mut rand::thread_rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<ProxyEndpoint>> {
        self.proxies.choose(rng).cloned()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProxyEndpoint>> {
        self.proxies.iter()
    }
}
