use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;

/// What came back from the search endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOutcome {
    pub status: u16,
    pub body_bytes: usize,
}

/// Blocking GET transport. `Err` means no HTTP response was received.
pub trait SearchHttp {
    fn get(&self, url: &str) -> Result<HttpOutcome>;
}

impl<T: SearchHttp + ?Sized> SearchHttp for &T {
    fn get(&self, url: &str) -> Result<HttpOutcome> {
        (**self).get(url)
    }
}

/// reqwest-backed transport. Connects directly; proxy variables are ignored so
/// they cannot skew latency.
pub struct BlockingSearchHttp {
    client: Client,
}

impl BlockingSearchHttp {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pagesweep/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl SearchHttp for BlockingSearchHttp {
    fn get(&self, url: &str) -> Result<HttpOutcome> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        let status = response.status().as_u16();
        // Latency covers the full body, not just the headers.
        let body = response
            .bytes()
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(HttpOutcome {
            status,
            body_bytes: body.len(),
        })
    }
}
