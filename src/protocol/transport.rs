//! Shared HTTP transport for both protocol clients.

use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::auth::AuthConfig;
use super::retry::RetryPolicy;
use super::RetrieveResponse;
use crate::error::{LoaderError, Result};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body excerpt kept in a protocol error message.
const MAX_ERROR_BODY: usize = 256;

/// Executes GET requests with authentication, retry and cancellation.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    auth: AuthConfig,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(auth: AuthConfig, retry: RetryPolicy, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("dicom-loader/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoaderError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            auth,
            retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// GET `url` with the given `Accept` header under the retry policy.
    ///
    /// Cancelling `cancel` drops the in-flight request and stops scheduling
    /// further attempts.
    pub async fn get(
        &self,
        url: &Url,
        accept: &str,
        cancel: &CancellationToken,
    ) -> Result<RetrieveResponse> {
        self.retry
            .run(cancel, |attempt| self.get_once(url, accept, attempt))
            .await
    }

    async fn get_once(&self, url: &Url, accept: &str, attempt: u32) -> Result<RetrieveResponse> {
        debug!(url = %url, accept, attempt, "GET");

        let request = self.client.get(url.clone()).header(ACCEPT, accept);
        let request = self.auth.apply(request).await?;
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut message = body.trim().to_string();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            if message.is_empty() {
                message = status.canonical_reason().unwrap_or("").to_string();
            }
            return Err(LoaderError::Protocol {
                status: status.as_u16(),
                message,
            });
        }

        let headers = response.headers().clone();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let payload: Bytes = response.bytes().await?;

        Ok(RetrieveResponse {
            payload,
            headers,
            status: status.as_u16(),
            content_type,
        })
    }
}
