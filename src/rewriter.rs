//! Reference Rewriter (C5): rewrites cross-directory identity in a resource
//! body into local identity, via a schema-less recursive walk of the JSON
//! tree (spec §9 "Dynamic JSON walking" — a visitor over {object, array,
//! string, number, bool, null} that preserves unknown fields verbatim).

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::db::ResourceMapStore;
use crate::models::ResourceKey;
use crate::{Error, Result};

pub struct RewriteContext<'a> {
    pub directory_id: &'a str,
    pub directory_base_url: &'a Url,
    pub map_store: &'a Arc<dyn ResourceMapStore>,
}

/// Rewrites `resource` in place against the directory's own origin, per
/// spec §4.5. Returns the (re-serialized) resource on success; an error
/// causes the caller to skip the containing entry.
pub async fn rewrite_resource(ctx: &RewriteContext<'_>, mut resource: Value) -> Result<Value> {
    if let Some(meta) = resource.get_mut("meta").and_then(Value::as_object_mut) {
        meta.remove("versionId");
        meta.remove("lastUpdated");
    }

    rewrite_references(ctx, &mut resource).await?;
    rewrite_full_urls(ctx, &mut resource).await?;
    rewrite_identifiers(ctx, &mut resource);

    Ok(resource)
}

/// Walks every object in the tree looking for a `reference` field and
/// resolves it to a local id via the map store, reserving one if necessary
/// (the *reserve-then-fill* rule, spec §9).
fn rewrite_references<'a>(
    ctx: &'a RewriteContext<'a>,
    value: &'a mut Value,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(reference)) = map.get("reference").cloned() {
                    let rewritten = resolve_reference(ctx, &reference).await?;
                    map.insert("reference".to_string(), Value::String(rewritten));
                }
                for (_, v) in map.iter_mut() {
                    rewrite_references(ctx, v).await?;
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    rewrite_references(ctx, item).await?;
                }
            }
            _ => {}
        }
        Ok(())
    })
}

/// `fullUrl` entries inside contained Bundles follow the same resolution
/// rule as `reference` (spec §4.5 step 3).
fn rewrite_full_urls<'a>(
    ctx: &'a RewriteContext<'a>,
    value: &'a mut Value,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(full_url)) = map.get("fullUrl").cloned() {
                    let rewritten = resolve_reference(ctx, &full_url).await?;
                    map.insert("fullUrl".to_string(), Value::String(rewritten));
                }
                for (_, v) in map.iter_mut() {
                    rewrite_full_urls(ctx, v).await?;
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    rewrite_full_urls(ctx, item).await?;
                }
            }
            _ => {}
        }
        Ok(())
    })
}

/// Parses `{RType}/{id}` or an absolute same-origin URL and returns the
/// rewritten `{RType}/{local_id}` form. A third-party-origin reference is
/// rejected with `CrossOriginReference` (spec §4.5 step 5).
async fn resolve_reference(ctx: &RewriteContext<'_>, reference: &str) -> Result<String> {
    let (rtype, remote_id) = if reference.contains("://") {
        let url = Url::parse(reference)
            .map_err(|_| Error::ParseInvalidResource(format!("unparseable reference: {reference}")))?;
        if url.origin() != ctx.directory_base_url.origin() {
            return Err(Error::CrossOriginReference(reference.to_string()));
        }
        split_rtype_id(url.path())?
    } else {
        split_rtype_id(reference)?
    };

    let key = ResourceKey::new(ctx.directory_id.to_string(), rtype.clone(), remote_id);
    let map = ctx.map_store.allocate(&key).await?;
    Ok(format!("{rtype}/{}", map.update_client_resource_id))
}

fn split_rtype_id(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_start_matches('/');
    let mut parts = trimmed.rsplitn(2, '/');
    let id = parts.next().unwrap_or_default();
    let rtype = parts.next().unwrap_or_default();
    if rtype.is_empty() || id.is_empty() {
        return Err(Error::ParseInvalidResource(format!(
            "reference is not {{RType}}/{{id}}: {path}"
        )));
    }
    Ok((rtype.to_string(), id.to_string()))
}

/// Strips identifiers whose `system` is the directory's own namespace
/// (spec §4.5 step 4; open question resolved in favor of stripping, see
/// DESIGN.md). Externally meaningful identifiers are preserved verbatim.
fn rewrite_identifiers(ctx: &RewriteContext<'_>, value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Array(identifiers)) = map.get_mut("identifier") {
                let base = ctx.directory_base_url.as_str();
                identifiers.retain(|ident| {
                    ident
                        .get("system")
                        .and_then(Value::as_str)
                        .map(|system| system != base)
                        .unwrap_or(true)
                });
            }
            for (_, v) in map.iter_mut() {
                rewrite_identifiers(ctx, v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_identifiers(ctx, item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::models::ResourceMap;

    struct FakeMapStore {
        rows: Mutex<HashMap<(String, String, String), ResourceMap>>,
    }

    impl FakeMapStore {
        fn new() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl ResourceMapStore for FakeMapStore {
        async fn lookup(&self, key: &ResourceKey) -> Result<Option<ResourceMap>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .get(&(
                    key.directory_id.clone(),
                    key.resource_type.clone(),
                    key.directory_resource_id.clone(),
                ))
                .cloned())
        }

        async fn allocate(&self, key: &ResourceKey) -> Result<ResourceMap> {
            let mut rows = self.rows.lock().unwrap();
            let k = (
                key.directory_id.clone(),
                key.resource_type.clone(),
                key.directory_resource_id.clone(),
            );
            if let Some(existing) = rows.get(&k) {
                return Ok(existing.clone());
            }
            let now: DateTime<Utc> = DateTime::UNIX_EPOCH.into();
            let map = ResourceMap {
                id: uuid::Uuid::new_v4(),
                directory_id: key.directory_id.clone(),
                resource_type: key.resource_type.clone(),
                directory_resource_id: key.directory_resource_id.clone(),
                directory_resource_version: None,
                update_client_resource_id: crate::models::new_update_client_resource_id(
                    &key.directory_id,
                ),
                update_client_resource_version: None,
                last_update: None,
                created_at: now,
                modified_at: now,
            };
            rows.insert(k, map.clone());
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

        async fn delete(&self, _map_id: uuid::Uuid) -> Result<()> {
            Ok(())
        }

        async fn list_for_directory(&self, _directory_id: &str) -> Result<Vec<ResourceMap>> {
            Ok(vec![])
        }
    }

    fn ctx<'a>(base: &'a Url, store: &'a Arc<dyn ResourceMapStore>) -> RewriteContext<'a> {
        RewriteContext {
            directory_id: "dir-a",
            directory_base_url: base,
            map_store: store,
        }
    }

    #[tokio::test]
    async fn relative_reference_is_rewritten_to_local_id() {
        let base = Url::parse("https://directory-a.example/fhir/").unwrap();
        let store: Arc<dyn ResourceMapStore> = Arc::new(FakeMapStore::new());
        let c = ctx(&base, &store);

        let resource = serde_json::json!({
            "resourceType": "Organization",
            "id": "1",
            "partOf": { "reference": "Organization/2" },
            "meta": { "versionId": "3", "lastUpdated": "2024-01-01T00:00:00Z" }
        });

        let rewritten = rewrite_resource(&c, resource).await.unwrap();
        let reference = rewritten["partOf"]["reference"].as_str().unwrap();
        assert!(reference.starts_with("Organization/"));
        assert_ne!(reference, "Organization/2");
        assert!(rewritten.get("meta").unwrap().get("versionId").is_none());
    }

    #[tokio::test]
    async fn same_reference_resolves_to_same_local_id_twice() {
        let base = Url::parse("https://directory-a.example/fhir/").unwrap();
        let store: Arc<dyn ResourceMapStore> = Arc::new(FakeMapStore::new());
        let c = ctx(&base, &store);

        let first = resolve_reference(&c, "Organization/2").await.unwrap();
        let second = resolve_reference(&c, "Organization/2").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cross_origin_reference_is_rejected() {
        let base = Url::parse("https://directory-a.example/fhir/").unwrap();
        let store: Arc<dyn ResourceMapStore> = Arc::new(FakeMapStore::new());
        let c = ctx(&base, &store);

        let err = resolve_reference(&c, "https://other.example/fhir/Organization/9")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossOriginReference(_)));
    }

    #[test]
    fn identifier_in_own_namespace_is_stripped() {
        let base = Url::parse("https://directory-a.example/fhir/").unwrap();
        let store: Arc<dyn ResourceMapStore> = Arc::new(FakeMapStore::new());
        let c = ctx(&base, &store);

        let mut resource = serde_json::json!({
            "resourceType": "Organization",
            "identifier": [
                { "system": "https://directory-a.example/fhir/", "value": "1" },
                { "system": "urn:oid:2.16.840", "value": "external" }
            ]
        });

        rewrite_identifiers(&c, &mut resource);
        let identifiers = resource["identifier"].as_array().unwrap();
        assert_eq!(identifiers.len(), 1);
        assert_eq!(identifiers[0]["system"], "urn:oid:2.16.840");
    }

    #[test]
    fn split_rtype_id_rejects_malformed_reference() {
        assert!(split_rtype_id("no-slash-here").is_err());
        assert!(split_rtype_id("Organization/2").is_ok());
    }
}
