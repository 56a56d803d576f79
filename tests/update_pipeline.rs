//! End-to-end exercise of the update pipeline against mocked HTTP directory
//! and local-store endpoints (spec §4.6), covering what the in-process fakes
//! in `pipeline::update`'s unit tests don't: the real `HttpDirectoryClient`
//! pagination/capability parsing and `HttpLocalWriter` PUT behavior.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcsd_update_client::cancellation;
use mcsd_update_client::db::{DirectoryRegistry, ResourceMapStore};
use mcsd_update_client::directory_client::{HttpDirectoryClientFactory, RetryPolicy};
use mcsd_update_client::local_writer::HttpLocalWriter;
use mcsd_update_client::models::{Directory, DirectoryOrigin, ResourceKey, ResourceMap};
use mcsd_update_client::pipeline::{PassOutcome, UpdatePipeline};
use mcsd_update_client::Result;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        max_attempts: 2,
        jitter_ratio: 0.0,
    }
}

struct NoopRegistry;

#[async_trait]
impl DirectoryRegistry for NoopRegistry {
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
        Ok(())
    }
    async fn mark_failure(&self, _: &str, _: i32) -> Result<bool> {
        Ok(false)
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

#[derive(Default)]
struct InMemoryMapStore {
    maps: Mutex<Vec<ResourceMap>>,
}

#[async_trait]
impl ResourceMapStore for InMemoryMapStore {
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

fn directory(id: &str, endpoint: &str) -> Directory {
    let now = Utc::now();
    Directory {
        id: id.to_string(),
        endpoint_address: endpoint.to_string(),
        origin: "manual".to_string(),
        failed_sync_count: 0,
        failed_attempts: 0,
        last_success_sync: None,
        is_ignored: false,
        deleted_at: None,
        created_at: now,
        modified_at: now,
    }
}

#[tokio::test]
async fn full_pass_writes_entries_via_history_and_counts_bytes() {
    let remote = MockServer::start().await;
    let local = MockServer::start().await;

    let all_rtypes = [
        "Organization",
        "Location",
        "Endpoint",
        "HealthcareService",
        "Practitioner",
        "PractitionerRole",
        "OrganizationAffiliation",
    ];

    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "CapabilityStatement",
            "rest": [{
                "resource": all_rtypes.iter().map(|t| json!({
                    "type": t,
                    "interaction": [{ "code": "history-type" }]
                })).collect::<Vec<_>>()
            }]
        })))
        .mount(&remote)
        .await;

    Mock::given(method("GET"))
        .and(path("/fhir/Organization/_history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceType": "Bundle",
            "entry": [
                { "resource": { "resourceType": "Organization", "id": "1", "name": "Example" } }
            ]
        })))
        .mount(&remote)
        .await;

    for rtype in ["Location", "Endpoint", "HealthcareService", "Practitioner", "PractitionerRole", "OrganizationAffiliation"] {
        Mock::given(method("GET"))
            .and(path(format!("/fhir/{rtype}/_history")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "resourceType": "Bundle", "entry": [] })))
            .mount(&remote)
            .await;
    }

    Mock::given(method("PUT"))
        .and(path_regex(r"^/local/Organization/.+$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&local)
        .await;

    let client_factory = Arc::new(HttpDirectoryClientFactory::new(
        Duration::from_secs(5),
        50,
        retry(),
    ));
    let writer = Arc::new(
        HttpLocalWriter::new(
            url::Url::parse(&format!("{}/local/", local.uri())).unwrap(),
            Duration::from_secs(5),
            retry(),
        )
        .unwrap(),
    );

    let pipeline = UpdatePipeline::new(
        Arc::new(NoopRegistry),
        Arc::new(InMemoryMapStore::default()),
        client_factory,
        writer,
        None,
        false,
        20,
        Duration::from_secs(300),
    );

    let dir = directory("dir-a", &format!("{}/fhir/", remote.uri()));
    let (_tx, cancel) = cancellation::pair();

    let report = pipeline.run(&dir, &cancel).await.unwrap();

    assert_eq!(report.outcome, PassOutcome::Success);
    assert_eq!(report.counters.entries_written, 1);
    assert!(report.counters.bytes_transferred > 0);
}

#[tokio::test]
async fn auth_rejected_on_remote_page_aborts_pass() {
    let remote = MockServer::start().await;
    let local = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fhir/metadata"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&remote)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/fhir/.+/_history$"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&remote)
        .await;

    let client_factory = Arc::new(HttpDirectoryClientFactory::new(
        Duration::from_secs(5),
        50,
        retry(),
    ));
    let writer = Arc::new(
        HttpLocalWriter::new(
            url::Url::parse(&format!("{}/local/", local.uri())).unwrap(),
            Duration::from_secs(5),
            retry(),
        )
        .unwrap(),
    );

    let pipeline = UpdatePipeline::new(
        Arc::new(NoopRegistry),
        Arc::new(InMemoryMapStore::default()),
        client_factory,
        writer,
        None,
        false,
        20,
        Duration::from_secs(300),
    );

    let dir = directory("dir-b", &format!("{}/fhir/", remote.uri()));
    let (_tx, cancel) = cancellation::pair();

    let report = pipeline.run(&dir, &cancel).await.unwrap();

    assert_eq!(report.outcome, PassOutcome::Failure);
    assert_eq!(report.counters.entries_written, 0);
}
