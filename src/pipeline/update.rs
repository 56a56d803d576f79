//! Update Pipeline (C6): one pass over a single directory's history/search
//! pages, rewriting and writing each entry into the local store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::MetadataCache;
use crate::cancellation::CancellationToken;
use crate::db::{DirectoryRegistry, ResourceMapStore};
use crate::directory_client::{DirectoryClient, DirectoryClientFactory};
use crate::local_writer::LocalWriter;
use crate::models::{Directory, ResourceKey, MCSD_RESOURCE_TYPES};
use crate::pipeline::{PassCounters, PassOutcome, PassReport};
use crate::rewriter::{rewrite_resource, RewriteContext};
use crate::{Error, Result};

pub struct UpdatePipeline {
    registry: Arc<dyn DirectoryRegistry>,
    map_store: Arc<dyn ResourceMapStore>,
    client_factory: Arc<dyn DirectoryClientFactory>,
    writer: Arc<dyn LocalWriter>,
    cache: Option<Arc<MetadataCache>>,
    strict_validation: bool,
    ignore_after_failures: i32,
    pass_soft_deadline: Duration,
}

impl UpdatePipeline {
    pub fn new(
        registry: Arc<dyn DirectoryRegistry>,
        map_store: Arc<dyn ResourceMapStore>,
        client_factory: Arc<dyn DirectoryClientFactory>,
        writer: Arc<dyn LocalWriter>,
        cache: Option<Arc<MetadataCache>>,
        strict_validation: bool,
        ignore_after_failures: i32,
        pass_soft_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            map_store,
            client_factory,
            writer,
            cache,
            strict_validation,
            ignore_after_failures,
            pass_soft_deadline,
        }
    }

    /// Runs one full pass for `directory` (spec §4.6). The watermark only
    /// advances when the pass completes without a structural error. A
    /// structural error anywhere — a malformed/unauthenticated page fetch, or
    /// a structural failure surfaced from an individual entry (auth rejection,
    /// database unavailability) — aborts the whole pass and counts as a
    /// failed attempt; everything else is recoverable and only skips the
    /// offending entry (spec §4.6 "Partial-failure semantics").
    pub async fn run(&self, directory: &Directory, cancel: &CancellationToken) -> Result<PassReport> {
        let started = Instant::now();
        let deadline_at = started + self.pass_soft_deadline;
        let mut counters = PassCounters::default();
        let watermark = directory.watermark();
        let mut max_last_updated = watermark;

        let client = self.client_factory.create(&directory.endpoint_address)?;
        let capability = self.fetch_capability(directory, client.as_ref()).await.ok();

        for rtype in MCSD_RESOURCE_TYPES {
            if cancel.is_cancelled() {
                return Ok(self.finish(directory, PassOutcome::Cancelled, counters, started));
            }

            let use_history = capability
                .as_ref()
                .map(|cap| client.supports_history(rtype, cap))
                .unwrap_or(true);

            let result = if Instant::now() >= deadline_at {
                Err(Error::DeadlineExceeded)
            } else if use_history {
                self.drain_history(
                    client.as_ref(),
                    &directory.id,
                    rtype,
                    watermark,
                    cancel,
                    deadline_at,
                    &mut counters,
                    &mut max_last_updated,
                )
                .await
            } else {
                self.drain_search(
                    client.as_ref(),
                    &directory.id,
                    rtype,
                    watermark,
                    cancel,
                    deadline_at,
                    &mut counters,
                    &mut max_last_updated,
                )
                .await
            };

            match result {
                Ok(true) => {}
                Ok(false) => return Ok(self.finish(directory, PassOutcome::Cancelled, counters, started)),
                Err(e) => {
                    if e.is_structural() {
                        tracing::warn!(directory_id = %directory.id, resource_type = rtype, error = %e, "pass aborted");
                    }
                    self.registry.mark_failure(&directory.id, self.ignore_after_failures).await.ok();
                    return Ok(self.finish(directory, PassOutcome::Failure, counters, started));
                }
            }
        }

        self.registry
            .mark_success(&directory.id, max_last_updated)
            .await?;
        Ok(self.finish(directory, PassOutcome::Success, counters, started))
    }

    /// Capability statements are read-through cached (spec §4.10, C10):
    /// slow-changing metadata, never the history/search pages themselves.
    async fn fetch_capability(&self, directory: &Directory, client: &dyn DirectoryClient) -> Result<Value> {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_or_load(Some(&directory.id), "capability", || client.capability())
                    .await
            }
            None => client.capability().await,
        }
    }

    fn finish(
        &self,
        directory: &Directory,
        outcome: PassOutcome,
        mut counters: PassCounters,
        started: Instant,
    ) -> PassReport {
        counters.wall_time_ms = started.elapsed().as_millis() as u64;
        PassReport {
            directory_id: directory.id.clone(),
            outcome,
            counters,
        }
    }

    /// Returns `Ok(true)` on exhaustion, `Ok(false)` if cancelled mid-walk.
    /// Propagates a structural error from `apply_entry` (spec §7) or a
    /// `DeadlineExceeded` once `deadline_at` passes, either of which aborts
    /// the whole pass (checked in `run`'s match on this result).
    async fn drain_history(
        &self,
        client: &dyn DirectoryClient,
        directory_id: &str,
        rtype: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
        deadline_at: Instant,
        counters: &mut PassCounters,
        max_last_updated: &mut DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!("_since={}", since.to_rfc3339());
        let mut page = client.history_page(rtype, &query).await?;

        loop {
            counters.bytes_transferred += page.bytes;
            for entry in &page.entries {
                self.apply_entry(client, directory_id, rtype, entry, counters, max_last_updated)
                    .await?;
            }
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if Instant::now() >= deadline_at {
                return Err(Error::DeadlineExceeded);
            }
            match &page.next {
                Some(next) => {
                    page = client.follow_page(next).await?;
                }
                None => return Ok(true),
            }
        }
    }

    async fn drain_search(
        &self,
        client: &dyn DirectoryClient,
        directory_id: &str,
        rtype: &str,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
        deadline_at: Instant,
        counters: &mut PassCounters,
        max_last_updated: &mut DateTime<Utc>,
    ) -> Result<bool> {
        let query = format!("_lastUpdated=ge{}", since.to_rfc3339());
        let mut page = client.search_page(rtype, &query).await?;

        loop {
            counters.bytes_transferred += page.bytes;
            for entry in &page.entries {
                self.apply_entry(client, directory_id, rtype, entry, counters, max_last_updated)
                    .await?;
            }
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if Instant::now() >= deadline_at {
                return Err(Error::DeadlineExceeded);
            }
            match &page.next {
                Some(next) => {
                    page = client.follow_page(next).await?;
                }
                None => return Ok(true),
            }
        }
    }

    /// Applies one Bundle entry (spec §4.6 step 3). A per-entry failure is
    /// logged and skipped without failing the pass, *unless* it is
    /// structural (spec §7: auth rejection, database unavailability) — those
    /// are propagated so the caller aborts the pass and leaves the watermark
    /// unchanged, same as a structural page-fetch error.
    async fn apply_entry(
        &self,
        client: &dyn DirectoryClient,
        directory_id: &str,
        rtype: &str,
        entry: &Value,
        counters: &mut PassCounters,
        max_last_updated: &mut DateTime<Utc>,
    ) -> Result<()> {
        counters.entries_seen += 1;

        let method = entry
            .get("request")
            .and_then(|r| r.get("method"))
            .and_then(Value::as_str);

        let resource = entry.get("resource");

        if let Some(last_updated) = resource
            .and_then(|r| r.get("meta"))
            .and_then(|m| m.get("lastUpdated"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            let last_updated = last_updated.with_timezone(&Utc);
            if last_updated > *max_last_updated {
                *max_last_updated = last_updated;
            }
        }

        match self
            .apply_single(client, directory_id, rtype, method, entry, resource)
            .await
        {
            Ok(Applied::Written(bytes)) => {
                counters.entries_written += 1;
                counters.bytes_transferred += bytes;
            }
            Ok(Applied::Deleted) => counters.entries_deleted += 1,
            Err(e) if e.is_structural() => return Err(e),
            Err(e) => {
                tracing::warn!(resource_type = rtype, error = %e, "skipping entry");
                counters.entries_skipped += 1;
            }
        }
        Ok(())
    }

    async fn apply_single(
        &self,
        client: &dyn DirectoryClient,
        directory_id: &str,
        rtype: &str,
        method: Option<&str>,
        entry: &Value,
        resource: Option<&Value>,
    ) -> Result<Applied> {
        if method == Some("DELETE") {
            let remote_id = entry
                .get("request")
                .and_then(|r| r.get("url"))
                .and_then(Value::as_str)
                .and_then(|url| url.rsplit('/').next())
                .ok_or_else(|| Error::ParseInvalidResource("delete entry missing url".into()))?;

            let key = ResourceKey::new(directory_id, rtype, remote_id);
            if let Some(map) = self.map_store.lookup(&key).await? {
                self.writer.delete(rtype, &map.update_client_resource_id).await?;
                self.map_store.delete(map.id).await?;
            }
            return Ok(Applied::Deleted);
        }

        let body = resource
            .cloned()
            .ok_or_else(|| Error::ParseInvalidResource("non-delete entry missing resource".into()))?;

        let remote_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ParseInvalidResource("resource missing id".into()))?
            .to_string();

        let base_url = client.base_url().clone();

        let ctx = RewriteContext {
            directory_id,
            directory_base_url: &base_url,
            map_store: &self.map_store,
        };

        let rewritten = rewrite_resource(&ctx, body).await?;

        if self.strict_validation && rewritten.get("resourceType").is_none() {
            return Err(Error::ValidationFailed("resource missing resourceType".into()));
        }

        let key = ResourceKey::new(directory_id, rtype, remote_id);
        let map = self.map_store.allocate(&key).await?;

        let bytes = self
            .writer
            .put(rtype, &map.update_client_resource_id, &rewritten)
            .await?;

        let remote_version = body
            .get("meta")
            .and_then(|m| m.get("versionId"))
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<i32>().ok());

        self.map_store
            .record_versions(map.id, remote_version, None, Utc::now())
            .await?;

        Ok(Applied::Written(bytes))
    }
}

enum Applied {
    Written(u64),
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DirectoryRegistry;
    use crate::directory_client::Page;
    use crate::models::{Directory, DirectoryOrigin, ResourceMap};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use url::Url;

    struct FakeClient {
        base: Url,
    }

    #[async_trait]
    impl DirectoryClient for FakeClient {
        fn base_url(&self) -> &Url {
            &self.base
        }
        async fn capability(&self) -> Result<Value> {
            unimplemented!("not exercised by apply_entry tests")
        }
        async fn search_page(&self, _rtype: &str, _query: &str) -> Result<Page> {
            unimplemented!("not exercised by apply_entry tests")
        }
        async fn history_page(&self, _rtype: &str, _query: &str) -> Result<Page> {
            unimplemented!("not exercised by apply_entry tests")
        }
        async fn follow_page(&self, _next_url: &str) -> Result<Page> {
            unimplemented!("not exercised by apply_entry tests")
        }
        async fn read(&self, _rtype: &str, _remote_id: &str) -> Result<Option<Value>> {
            unimplemented!("not exercised by apply_entry tests")
        }
        fn supports_history(&self, _rtype: &str, _capability: &Value) -> bool {
            true
        }
    }

    struct UnusedRegistry;

    #[async_trait]
    impl DirectoryRegistry for UnusedRegistry {
        async fn upsert(&self, _: &str, _: &str, _: DirectoryOrigin) -> Result<Directory> {
            unimplemented!()
        }
        async fn get(&self, _: &str) -> Result<Option<Directory>> {
            unimplemented!()
        }
        async fn list_eligible_for_update(&self, _: DateTime<Utc>) -> Result<Vec<Directory>> {
            unimplemented!()
        }
        async fn list_eligible_for_cleanup(&self, _: DateTime<Utc>) -> Result<Vec<Directory>> {
            unimplemented!()
        }
        async fn mark_success(&self, _: &str, _: DateTime<Utc>) -> Result<()> {
            unimplemented!()
        }
        async fn mark_failure(&self, _: &str, _: i32) -> Result<bool> {
            unimplemented!()
        }
        async fn mark_ignored(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn unignore(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn schedule_delete(&self, _: &str, _: DateTime<Utc>) -> Result<()> {
            unimplemented!()
        }
        async fn purge(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn reset_after_cleanup(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
    }

    struct UnusedClientFactory;

    impl DirectoryClientFactory for UnusedClientFactory {
        fn create(&self, _base_url: &str) -> Result<Arc<dyn DirectoryClient>> {
            unimplemented!()
        }
    }

    #[derive(Default)]
    struct FakeMapStore {
        maps: Mutex<Vec<ResourceMap>>,
    }

    #[async_trait]
    impl ResourceMapStore for FakeMapStore {
        async fn lookup(&self, key: &ResourceKey) -> Result<Option<ResourceMap>> {
            Ok(self
                .maps
                .lock()
                .unwrap()
                .iter()
                .find(|m| {
                    m.directory_id == key.directory_id
                        && m.resource_type == key.resource_type
                        && m.directory_resource_id == key.directory_resource_id
                })
                .cloned())
        }

        async fn allocate(&self, key: &ResourceKey) -> Result<ResourceMap> {
            if let Some(existing) = self.lookup(key).await? {
                return Ok(existing);
            }
            let map = ResourceMap {
                id: uuid::Uuid::new_v4(),
                directory_id: key.directory_id.clone(),
                resource_type: key.resource_type.clone(),
                directory_resource_id: key.directory_resource_id.clone(),
                directory_resource_version: None,
                update_client_resource_id: format!("local-{}", key.directory_resource_id),
                update_client_resource_version: None,
                last_update: None,
                created_at: Utc::now(),
                modified_at: Utc::now(),
            };
            self.maps.lock().unwrap().push(map.clone());
            Ok(map)
        }

        async fn record_versions(
            &self,
            _map_id: uuid::Uuid,
            _directory_resource_version: Option<i32>,
            _update_client_resource_version: Option<i32>,
            _t: DateTime<Utc>,
        ) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, map_id: uuid::Uuid) -> Result<()> {
            self.maps.lock().unwrap().retain(|m| m.id != map_id);
            Ok(())
        }

        async fn list_for_directory(&self, _directory_id: &str) -> Result<Vec<ResourceMap>> {
            Ok(self.maps.lock().unwrap().clone())
        }
    }

    struct FakeWriter {
        fail_with_auth_rejected: bool,
    }

    #[async_trait]
    impl LocalWriter for FakeWriter {
        async fn put(&self, _rtype: &str, _local_id: &str, body: &Value) -> Result<u64> {
            if self.fail_with_auth_rejected {
                return Err(Error::AuthRejected("local store rejected request".into()));
            }
            Ok(serde_json::to_vec(body).unwrap().len() as u64)
        }

        async fn delete(&self, _rtype: &str, _local_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn pipeline(writer: FakeWriter) -> UpdatePipeline {
        UpdatePipeline::new(
            Arc::new(UnusedRegistry),
            Arc::new(FakeMapStore::default()),
            Arc::new(UnusedClientFactory),
            Arc::new(writer),
            None,
            false,
            20,
            Duration::from_secs(300),
        )
    }

    fn client() -> FakeClient {
        FakeClient {
            base: Url::parse("https://directory-a.example/fhir/").unwrap(),
        }
    }

    fn entry(id: &str) -> Value {
        serde_json::json!({ "resource": { "id": id, "resourceType": "Organization" } })
    }

    #[tokio::test]
    async fn structural_entry_error_aborts_and_is_not_counted_as_skipped() {
        let pipeline = pipeline(FakeWriter {
            fail_with_auth_rejected: true,
        });
        let client = client();
        let mut counters = PassCounters::default();
        let mut max_last_updated = DateTime::UNIX_EPOCH;

        let err = pipeline
            .apply_entry(&client, "dir-a", "Organization", &entry("1"), &mut counters, &mut max_last_updated)
            .await
            .unwrap_err();

        assert!(err.is_structural());
        assert_eq!(counters.entries_seen, 1);
        assert_eq!(counters.entries_skipped, 0);
        assert_eq!(counters.entries_written, 0);
    }

    #[tokio::test]
    async fn non_structural_entry_error_is_skipped_without_aborting() {
        let pipeline = pipeline(FakeWriter {
            fail_with_auth_rejected: false,
        });
        let client = client();
        let mut counters = PassCounters::default();
        let mut max_last_updated = DateTime::UNIX_EPOCH;

        // Missing "resource" field makes apply_single fail with
        // ParseInvalidResource, which is not structural.
        let bad_entry = serde_json::json!({});

        pipeline
            .apply_entry(&client, "dir-a", "Organization", &bad_entry, &mut counters, &mut max_last_updated)
            .await
            .unwrap();

        assert_eq!(counters.entries_skipped, 1);
        assert_eq!(counters.entries_written, 0);
    }

    #[tokio::test]
    async fn written_entry_counts_bytes_transferred() {
        let pipeline = pipeline(FakeWriter {
            fail_with_auth_rejected: false,
        });
        let client = client();
        let mut counters = PassCounters::default();
        let mut max_last_updated = DateTime::UNIX_EPOCH;

        pipeline
            .apply_entry(&client, "dir-a", "Organization", &entry("1"), &mut counters, &mut max_last_updated)
            .await
            .unwrap();

        assert_eq!(counters.entries_written, 1);
        assert!(counters.bytes_transferred > 0);
    }
}
