//! HTTP transport. The core only ever sees the [`Fetcher`] trait; the daemon
//! shares a single [`HttpFetcher`] (and so one connection pool) across every
//! configured tracker.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;

use crate::error::TransportError;
use crate::redact::redact_url;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `url` and return the body of a 2xx response.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("phonetrackd/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout(timeout);
    }
    // reqwest puts the full URL (token included) into its Display output
    TransportError::Request(redact_url(&err.without_url().to_string()))
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(e, timeout))?;
        Ok(body.to_vec())
    }
}
