//! FHIR Directory Client (C3): paginated search/history/read against a remote
//! mCSD directory, with bounded retry on transient failures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::sleep;
use url::Url;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::McsdClientConfig) -> Self {
        Self {
            initial_backoff: Duration::from_secs(config.retry_initial_backoff_seconds),
            max_backoff: Duration::from_secs(config.retry_max_backoff_seconds),
            max_attempts: config.retry_max_attempts,
            jitter_ratio: config.retry_jitter_ratio,
        }
    }
}

/// Deterministic-enough jitter source without adding a new RNG dependency to
/// the hot retry path.
pub(crate) fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }
    let bytes = *Uuid::new_v4().as_bytes();
    let value = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
    let unit = (value as f64) / (u64::MAX as f64);
    let signed = unit * 2.0 - 1.0;
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

/// One page of Bundle entries plus the `next` link, if any.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<Value>,
    pub next: Option<String>,
    /// Raw response body size (spec §4.6 step 5 `bytes_transferred`).
    pub bytes: u64,
}

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    fn base_url(&self) -> &Url;

    async fn capability(&self) -> Result<Value>;

    async fn search_page(&self, rtype: &str, query: &str) -> Result<Page>;

    async fn history_page(&self, rtype: &str, query: &str) -> Result<Page>;

    async fn follow_page(&self, next_url: &str) -> Result<Page>;

    async fn read(&self, rtype: &str, remote_id: &str) -> Result<Option<Value>>;

    fn supports_history(&self, rtype: &str, capability: &Value) -> bool;
}

/// Builds a `DirectoryClient` bound to one directory's endpoint. A directory's
/// `endpoint_address` is only known at pass time (spec §3 "Directory record"),
/// so the pipeline holds a factory rather than a single fixed client.
pub trait DirectoryClientFactory: Send + Sync {
    fn create(&self, base_url: &str) -> Result<std::sync::Arc<dyn DirectoryClient>>;
}

pub struct HttpDirectoryClientFactory {
    request_timeout: Duration,
    page_size: u32,
    retry: RetryPolicy,
}

impl HttpDirectoryClientFactory {
    pub fn new(request_timeout: Duration, page_size: u32, retry: RetryPolicy) -> Self {
        Self {
            request_timeout,
            page_size,
            retry,
        }
    }
}

impl DirectoryClientFactory for HttpDirectoryClientFactory {
    fn create(&self, base_url: &str) -> Result<std::sync::Arc<dyn DirectoryClient>> {
        let url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid directory endpoint_address {base_url}: {e}")))?;
        let client = HttpDirectoryClient::new(url, self.request_timeout, self.page_size, self.retry.clone())?;
        Ok(std::sync::Arc::new(client))
    }
}

pub struct HttpDirectoryClient {
    http: Client,
    base_url: Url,
    page_size: u32,
    retry: RetryPolicy,
}

impl HttpDirectoryClient {
    pub fn new(base_url: Url, request_timeout: Duration, page_size: u32, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            http,
            base_url,
            page_size,
            retry,
        })
    }

    /// Resolves a reference found inside a directory's response body against
    /// that directory's own base URL (spec §4.3 "Transport contract"). Returns
    /// `Ok(None)` for a relative reference that is assumed same-origin by
    /// construction, `Ok(Some(true))` for absolute-but-matching, and
    /// `Err(CrossOriginReference)` otherwise.
    pub fn check_reference_origin(&self, reference: &str) -> Result<()> {
        if !reference.contains("://") {
            return Ok(());
        }
        match Url::parse(reference) {
            Ok(url) => {
                if url.origin() == self.base_url.origin() {
                    Ok(())
                } else {
                    Err(Error::CrossOriginReference(reference.to_string()))
                }
            }
            Err(_) => Err(Error::ParseInvalidResource(format!(
                "unparseable absolute reference: {reference}"
            ))),
        }
    }

    /// Returns `Ok(None)` for a `404` (the only status callers treat as a
    /// legitimate non-error outcome, per `read`'s `resource|404` contract).
    async fn get_with_retry(&self, url: &str) -> Result<Option<reqwest::Response>> {
        let mut attempt = 0u32;
        let mut backoff = self.retry.initial_backoff;

        loop {
            attempt += 1;
            let result = self
                .http
                .get(url)
                .header("Accept", "application/fhir+json")
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(Error::AuthRejected(format!(
                            "directory rejected request with {status}"
                        )));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        return Ok(Some(resp));
                    }
                    let retryable = status.is_server_error()
                        || status == StatusCode::REQUEST_TIMEOUT
                        || status.as_u16() == 425
                        || status == StatusCode::TOO_MANY_REQUESTS;
                    if !retryable || attempt >= self.retry.max_attempts {
                        return Err(Error::TransientNetwork(format!(
                            "directory returned {status} after {attempt} attempt(s)"
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

    async fn require_ok(&self, url: &str) -> Result<reqwest::Response> {
        self.get_with_retry(url)
            .await?
            .ok_or_else(|| Error::ParseInvalidResource(format!("unexpected 404 from {url}")))
    }

    fn parse_bundle(&self, body: Value, bytes: u64) -> Result<Page> {
        let entries = body
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let next = body
            .get("link")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find_map(|l| {
                    if l.get("relation").and_then(Value::as_str) == Some("next") {
                        l.get("url").and_then(Value::as_str).map(str::to_string)
                    } else {
                        None
                    }
                })
            });

        Ok(Page { entries, next, bytes })
    }

    /// Reads the full response body once so its byte length can be counted
    /// (spec §4.6 step 5), then parses it as JSON.
    async fn read_json_body(&self, resp: reqwest::Response) -> Result<(Value, u64)> {
        let raw = resp.bytes().await.map_err(Error::Http)?;
        let body: Value = serde_json::from_slice(&raw)
            .map_err(|e| Error::MalformedPage(format!("invalid JSON body: {e}")))?;
        Ok((body, raw.len() as u64))
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn capability(&self) -> Result<Value> {
        let url = self.base_url.join("metadata").map_err(|e| Error::Internal(e.to_string()))?;
        let resp = self.require_ok(url.as_str()).await?;
        resp.json::<Value>().await.map_err(Error::Http)
    }

    async fn search_page(&self, rtype: &str, query: &str) -> Result<Page> {
        let mut url = self
            .base_url
            .join(rtype)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let count = format!("_count={}", self.page_size);
        let qs = if query.is_empty() {
            count
        } else {
            format!("{query}&{count}")
        };
        url.set_query(Some(&qs));
        let resp = self.require_ok(url.as_str()).await?;
        let (body, bytes) = self.read_json_body(resp).await?;
        self.parse_bundle(body, bytes)
    }

    async fn history_page(&self, rtype: &str, query: &str) -> Result<Page> {
        let path = format!("{rtype}/_history");
        let mut url = self
            .base_url
            .join(&path)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let count = format!("_count={}", self.page_size);
        let qs = if query.is_empty() {
            count
        } else {
            format!("{query}&{count}")
        };
        url.set_query(Some(&qs));
        let resp = self.require_ok(url.as_str()).await?;
        let (body, bytes) = self.read_json_body(resp).await?;
        self.parse_bundle(body, bytes)
    }

    async fn follow_page(&self, next_url: &str) -> Result<Page> {
        let resp = self.require_ok(next_url).await?;
        let (body, bytes) = self.read_json_body(resp).await?;
        self.parse_bundle(body, bytes)
    }

    async fn read(&self, rtype: &str, remote_id: &str) -> Result<Option<Value>> {
        let path = format!("{rtype}/{remote_id}");
        let url = self
            .base_url
            .join(&path)
            .map_err(|e| Error::Internal(e.to_string()))?;
        match self.get_with_retry(url.as_str()).await? {
            Some(resp) => resp.json::<Value>().await.map(Some).map_err(Error::Http),
            None => Ok(None),
        }
    }

    fn supports_history(&self, rtype: &str, capability: &Value) -> bool {
        capability
            .get("rest")
            .and_then(Value::as_array)
            .and_then(|rests| rests.first())
            .and_then(|rest| rest.get("resource"))
            .and_then(Value::as_array)
            .and_then(|resources| {
                resources.iter().find(|r| r.get("type").and_then(Value::as_str) == Some(rtype))
            })
            .and_then(|r| r.get("interaction"))
            .and_then(Value::as_array)
            .map(|interactions| {
                interactions.iter().any(|i| {
                    i.get("code").and_then(Value::as_str) == Some("history-type")
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ratio() {
        let base = Duration::from_secs(10);
        for _ in 0..50 {
            let d = jittered_duration(base, 0.2);
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
    }

    #[test]
    fn zero_jitter_ratio_is_exact() {
        let base = Duration::from_secs(10);
        assert_eq!(jittered_duration(base, 0.0), base);
    }

    #[test]
    fn same_origin_reference_is_allowed() {
        let client = HttpDirectoryClient::new(
            Url::parse("https://directory-a.example/fhir/").unwrap(),
            Duration::from_secs(5),
            50,
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                max_attempts: 1,
                jitter_ratio: 0.0,
            },
        )
        .unwrap();

        assert!(client
            .check_reference_origin("https://directory-a.example/fhir/Organization/2")
            .is_ok());
        assert!(client.check_reference_origin("Organization/2").is_ok());
    }

    #[test]
    fn cross_origin_reference_is_rejected() {
        let client = HttpDirectoryClient::new(
            Url::parse("https://directory-a.example/fhir/").unwrap(),
            Duration::from_secs(5),
            50,
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                max_attempts: 1,
                jitter_ratio: 0.0,
            },
        )
        .unwrap();

        let err = client
            .check_reference_origin("https://other.example/fhir/Organization/9")
            .unwrap_err();
        assert!(matches!(err, Error::CrossOriginReference(_)));
    }
}
