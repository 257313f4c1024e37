//! Convoy core types – object keys, GVK keys, condition helpers and
//! the well-known labels/annotations shared by all controllers.

#![forbid(unsafe_code)]

use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};

pub mod conditions;

/// Label stamped on every object managed (and therefore cached) by convoy.
/// Dynamic-cache informers list/watch with `convoy.run/cache=True`.
pub const CACHE_LABEL: &str = "convoy.run/cache";
pub const CACHE_LABEL_VALUE: &str = "True";

/// Annotation holding the revision generation number used to order object sets.
pub const REVISION_ANNOTATION: &str = "convoy.run/revision";

/// Finalizer guarding dynamic-cache registrations of an owner.
pub const CACHED_FINALIZER: &str = "convoy.run/cached";

/// Field manager identity for server-side apply.
pub const FIELD_MANAGER: &str = "convoy";

/// When set non-empty, the adoption checker approves every adoption,
/// bypassing the previous-revision safety protocol.
pub const FORCE_ADOPTION_ENV: &str = "CONVOY_FORCE_ADOPTION";

/// Namespace/name pair addressing an object within a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn from_object(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Canonical GVK key, e.g. "v1/ConfigMap" or "convoy.run/v1alpha1/Package".
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Option<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Some(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Some(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => None,
    }
}

/// GVK of an unstructured object, if it carries type metadata.
pub fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Some(GroupVersionKind { group, version, kind: types.kind.clone() })
}

/// Stamp the cache label on an object, preserving other labels.
pub fn set_cache_label(obj: &mut DynamicObject) {
    obj.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CACHE_LABEL.to_string(), CACHE_LABEL_VALUE.to_string());
}

// ------------- Env helpers (feature flags) -------------

pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(default)
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_round_trips() {
        let core = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "ConfigMap".into() };
        assert_eq!(gvk_key(&core), "v1/ConfigMap");
        assert_eq!(parse_gvk_key("v1/ConfigMap"), Some(core));

        let grouped = GroupVersionKind {
            group: "convoy.run".into(),
            version: "v1alpha1".into(),
            kind: "Package".into(),
        };
        assert_eq!(gvk_key(&grouped), "convoy.run/v1alpha1/Package");
        assert_eq!(parse_gvk_key("convoy.run/v1alpha1/Package"), Some(grouped));

        assert_eq!(parse_gvk_key("not-a-key"), None);
        assert_eq!(parse_gvk_key("a/b/c/d"), None);
    }

    #[test]
    fn gvk_of_reads_type_meta() {
        let json = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" }
        });
        let obj: DynamicObject = serde_json::from_value(json).unwrap();
        let gvk = gvk_of(&obj).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
        assert_eq!(ObjectKey::from_object(&obj).to_string(), "prod/web");
    }

    #[test]
    fn cache_label_is_additive() {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "a", "labels": { "app": "web" } }
        }))
        .unwrap();
        set_cache_label(&mut obj);
        let labels = obj.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(CACHE_LABEL).map(String::as_str), Some("True"));
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
    }
}
