use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client as HttpClient;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::time::Duration;
use url::Url;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Issues a metadata probe. Non-success statuses are `FetchError::Status`.
    async fn probe(&self, url: &Url, timeout: Duration) -> Result<ProbeInfo, FetchError>;

    /// Starts a GET and returns the body as a chunk stream. Non-success
    /// statuses are `FetchError::Status`.
    async fn fetch(&self, url: &Url) -> Result<ByteStream, FetchError>;
}

#[derive(Clone)]
pub struct ReqwestFetcher {
    http_client: HttpClient,
}

impl ReqwestFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let http_client = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("dfvideo/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl MediaFetcher for ReqwestFetcher {
    async fn probe(&self, url: &Url, timeout: Duration) -> Result<ProbeInfo, FetchError> {
        let response = self
            .http_client
            .head(url.clone())
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(ProbeInfo {
            content_length,
            content_type,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<ByteStream, FetchError> {
        let response = self.http_client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        Ok(response.bytes_stream().map_err(FetchError::from).boxed())
    }
}
