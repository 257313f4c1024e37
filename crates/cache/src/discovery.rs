//! ApiResource lookup with a process-wide discovery cache.

use std::collections::HashMap;
use std::sync::RwLock;

use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use once_cell::sync::Lazy;
use tracing::debug;

use convoy_core::gvk_key;

use crate::CacheError;

// GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Resolve the ApiResource (plural, scope) for a GVK. The first miss runs a
/// full API discovery and seeds the cache for every served resource.
pub async fn resolve_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(ApiResource, bool), CacheError> {
    let key = gvk_key(gvk);
    if let Some(entry) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
        return Ok(entry);
    }

    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| CacheError::Discovery(e.to_string()))?;
    let mut found = None;
    {
        let mut cache = DISCOVERY_CACHE.write().unwrap();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let entry_key = gvk_key(&GroupVersionKind {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                });
                if entry_key == key {
                    found = Some((ar.clone(), namespaced));
                }
                cache.insert(entry_key, (ar, namespaced));
            }
        }
    }
    debug!(gvk = %key, hit = found.is_some(), "discovery ran");
    found.ok_or_else(|| CacheError::Discovery(format!("GVK not served: {key}")))
}
