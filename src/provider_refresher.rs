//! Provider-Directory Refresher (C9): periodically reconciles the set of
//! directories advertised by a provider (HTTP Bundle of `Endpoint`s, or a
//! JSON file) against the registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::Value;
use tokio::time::interval;

use crate::config::DirectoryProviderConfig;
use crate::db::{DirectoryRegistry, ProviderStore};
use crate::models::{DirectoryOrigin, ProviderDirectoryEntry};
use crate::{Error, Result};

pub struct ProviderRefresher {
    registry: Arc<dyn DirectoryRegistry>,
    providers: Arc<dyn ProviderStore>,
    http: Client,
    config: DirectoryProviderConfig,
}

impl ProviderRefresher {
    pub fn new(
        registry: Arc<dyn DirectoryRegistry>,
        providers: Arc<dyn ProviderStore>,
        config: DirectoryProviderConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            registry,
            providers,
            http,
            config,
        })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut ticker = interval(Duration::from_secs(self.config.refresh_interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    if let Err(e) = self.refresh_once().await {
                        tracing::error!(error = %e, "provider refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub async fn refresh_once(&self) -> Result<()> {
        let providers = self.providers.list_enabled().await?;
        for provider in providers {
            let entries = self.fetch_entries(&provider.url).await?;
            self.reconcile(provider.id, &entries).await?;
            self.providers.mark_refreshed(provider.id, Utc::now()).await?;
        }
        Ok(())
    }

    async fn fetch_entries(&self, source: &str) -> Result<Vec<ProviderDirectoryEntry>> {
        if let Some(path) = self.config.directory_urls_path.as_deref() {
            return self.fetch_from_file(path).await;
        }
        self.fetch_from_http(source).await
    }

    async fn fetch_from_http(&self, url: &str) -> Result<Vec<ProviderDirectoryEntry>> {
        let resp = self
            .http
            .get(url)
            .header("Accept", "application/fhir+json")
            .send()
            .await
            .map_err(Error::Http)?;

        if !resp.status().is_success() {
            return Err(Error::TransientNetwork(format!(
                "directory provider returned {}",
                resp.status()
            )));
        }

        let bundle: Value = resp.json().await.map_err(Error::Http)?;
        parse_endpoint_bundle(&bundle)
    }

    async fn fetch_from_file(&self, path: &str) -> Result<Vec<ProviderDirectoryEntry>> {
        let path = Path::new(path).to_path_buf();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Internal(format!("reading {}: {e}", path.display())))?;
        let entries: Vec<ProviderDirectoryEntry> = serde_json::from_str(&contents)
            .map_err(|e| Error::ParseInvalidResource(format!("directory urls file: {e}")))?;
        Ok(entries)
    }

    /// Reconciles the fetched set against the registry (spec §4.9): inserts
    /// new entries as `origin = provider`, refreshes `last_seen_at` for
    /// present ones, marks missing ones `removed_at` and schedules their
    /// cleanup. Manual entries are never touched here.
    async fn reconcile(&self, provider_id: i32, entries: &[ProviderDirectoryEntry]) -> Result<()> {
        let now = Utc::now();
        let mut seen_ids = Vec::with_capacity(entries.len());

        for entry in entries {
            self.registry
                .upsert(&entry.id, &entry.endpoint_address, DirectoryOrigin::Provider)
                .await?;
            self.providers
                .touch_seen(provider_id, &entry.id, now)
                .await?;
            seen_ids.push(entry.id.clone());
        }

        let removed = self
            .providers
            .mark_missing_removed(provider_id, &seen_ids, now)
            .await?;

        for directory_id in removed {
            if let Some(directory) = self.registry.get(&directory_id).await? {
                if directory.origin == DirectoryOrigin::Manual.to_string() {
                    continue;
                }
            }
            self.registry.schedule_delete(&directory_id, now).await?;
        }

        Ok(())
    }
}

fn parse_endpoint_bundle(bundle: &Value) -> Result<Vec<ProviderDirectoryEntry>> {
    let entries = bundle
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::ParseInvalidResource("provider response is not a Bundle".into()))?;

    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let resource = entry
            .get("resource")
            .ok_or_else(|| Error::ParseInvalidResource("Bundle entry missing resource".into()))?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ParseInvalidResource("Endpoint missing id".into()))?
            .to_string();
        let endpoint_address = resource
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ParseInvalidResource("Endpoint missing address".into()))?
            .to_string();
        out.push(ProviderDirectoryEntry {
            id,
            endpoint_address,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_bundle() {
        let bundle = serde_json::json!({
            "resourceType": "Bundle",
            "entry": [
                { "resource": { "resourceType": "Endpoint", "id": "dir-a", "address": "https://a.example/fhir" } },
                { "resource": { "resourceType": "Endpoint", "id": "dir-b", "address": "https://b.example/fhir" } }
            ]
        });

        let entries = parse_endpoint_bundle(&bundle).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "dir-a");
        assert_eq!(entries[1].endpoint_address, "https://b.example/fhir");
    }

    #[test]
    fn rejects_non_bundle_response() {
        let value = serde_json::json!({ "resourceType": "OperationOutcome" });
        assert!(parse_endpoint_bundle(&value).is_err());
    }
}
