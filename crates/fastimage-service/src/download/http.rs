//! Support to fetch resources from HTTP servers.

use std::io;
use std::time::Duration;

use futures::TryStreamExt;
use futures::future::BoxFuture;
use reqwest::{Client, Url, header};
use tokio_util::io::StreamReader;

use crate::caching::{CacheContents, CacheError};
use crate::config::DownloadTimeouts;

use super::{Transport, TransportResponse, USER_AGENT};

/// Transport implementation that fetches resources over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeouts: &DownloadTimeouts) -> CacheContents<Self> {
        let client = Client::builder()
            .gzip(true)
            .connect_timeout(timeouts.connect)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn open_url(&self, url: &str) -> CacheContents<TransportResponse> {
        let url = Url::parse(url)
            .map_err(|e| CacheError::TransportError(format!("invalid url `{url}`: {e}")))?;
        tracing::debug!("Fetching `{}`", url);

        let response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!("Unexpected status code from `{}`: {}", url, status);
            return Err(CacheError::TransportError(status.to_string()));
        }
        tracing::trace!("Success hitting `{}`", url);

        let content_length = response.content_length();
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(TransportResponse {
            content_length,
            body: Box::pin(StreamReader::new(stream)),
        })
    }
}

impl Transport for HttpTransport {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheContents<TransportResponse>> {
        Box::pin(self.open_url(url))
    }
}
