//! Local FHIR Writer (C4): idempotent PUT/DELETE against the local store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use url::Url;

use crate::directory_client::jittered_duration;
use crate::directory_client::RetryPolicy;
use crate::{Error, Result};

#[async_trait]
pub trait LocalWriter: Send + Sync {
    /// Returns the serialized request body size (spec §4.6 step 5
    /// `bytes_transferred`).
    async fn put(&self, rtype: &str, local_id: &str, body: &Value) -> Result<u64>;

    /// Idempotent: a 404 is treated as success (spec §4.4).
    async fn delete(&self, rtype: &str, local_id: &str) -> Result<()>;
}

pub struct HttpLocalWriter {
    http: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl HttpLocalWriter {
    pub fn new(base_url: Url, request_timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            http,
            base_url,
            retry,
        })
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        let mut backoff = self.retry.initial_backoff;

        loop {
            attempt += 1;
            let result = build().send().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(Error::AuthRejected(format!(
                            "local store rejected request with {status}"
                        )));
                    }
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let retryable = status.is_server_error()
                        || status == StatusCode::REQUEST_TIMEOUT
                        || status.as_u16() == 425
                        || status == StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt >= self.retry.max_attempts {
                        return Err(Error::TransientNetwork(format!(
                            "local store returned {status} after {attempt} attempt(s)"
                        )));
                    }
                }
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(Error::Http(e));
                    }
                }
            }

            let sleep_for = jittered_duration(backoff, self.retry.jitter_ratio);
            sleep(sleep_for).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }
    }
}

#[async_trait]
impl LocalWriter for HttpLocalWriter {
    async fn put(&self, rtype: &str, local_id: &str, body: &Value) -> Result<u64> {
        let path = format!("{rtype}/{local_id}");
        let url = self
            .base_url
            .join(&path)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let url_str = url.to_string();
        let encoded = serde_json::to_vec(body)
            .map_err(|e| Error::Internal(format!("failed to serialize resource: {e}")))?;
        let bytes = encoded.len() as u64;

        self.send_with_retry(|| {
            self.http
                .put(&url_str)
                .header("Content-Type", "application/fhir+json")
                .json(body)
        })
        .await?;
        Ok(bytes)
    }

    async fn delete(&self, rtype: &str, local_id: &str) -> Result<()> {
        let path = format!("{rtype}/{local_id}");
        let url = self
            .base_url
            .join(&path)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let url_str = url.to_string();

        // A straight send (not send_with_retry) so a bare 404 short-circuits
        // to success instead of being treated as a non-retryable failure.
        let mut attempt = 0u32;
        let mut backoff = self.retry.initial_backoff;
        loop {
            attempt += 1;
            match self.http.delete(&url_str).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::NOT_FOUND || status.is_success() {
                        return Ok(());
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(Error::AuthRejected(format!(
                            "local store rejected delete with {status}"
                        )));
                    }
                    let retryable = status.is_server_error()
                        || status == StatusCode::REQUEST_TIMEOUT
                        || status.as_u16() == 425
                        || status == StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt >= self.retry.max_attempts {
                        return Err(Error::TransientNetwork(format!(
                            "local store returned {status} after {attempt} attempt(s)"
                        )));
                    }
                }
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(Error::Http(e));
                    }
                }
            }
            let sleep_for = jittered_duration(backoff, self.retry.jitter_ratio);
            sleep(sleep_for).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }
    }
}
