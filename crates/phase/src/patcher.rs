//! Idempotent convergence: issue a server-side apply only when the desired
//! state is not already dominated by the live object.

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use serde_json::Value;

use convoy_cache::Writer;

use crate::PhaseError;

/// `desired` is the object as specified by the user, `current` the object as
/// present on the cluster, `updated` a copy of `current` already edited for
/// owner handling.
pub(crate) async fn patch(
    writer: &dyn Writer,
    desired: &DynamicObject,
    current: &DynamicObject,
    updated: &DynamicObject,
) -> Result<(), PhaseError> {
    let mut desired = desired.clone();
    desired.metadata.labels =
        merge_keys_from(updated.metadata.labels.clone(), desired.metadata.labels.take());
    desired.metadata.annotations =
        merge_keys_from(updated.metadata.annotations.clone(), desired.metadata.annotations.take());

    let mut patch = serde_json::to_value(&desired)
        .map_err(|e| PhaseError::InvalidObject(e.to_string()))?;
    // Never patch status, even if specified; that would start a fight with
    // whatever controller realizes this object.
    remove_field(&mut patch, &["status"]);
    // Owner references are converged by their own merge patch.
    remove_field(&mut patch, &["metadata", "ownerReferences"]);

    let mut base = serde_json::to_value(updated)
        .map_err(|e| PhaseError::InvalidObject(e.to_string()))?;
    remove_field(&mut base, &["status"]);

    if !is_derivative(&patch, &base) {
        if let Some(rv) = current.metadata.resource_version.as_deref() {
            patch["metadata"]["resourceVersion"] = Value::String(rv.to_string());
        }
        writer.patch_apply(updated, patch).await?;
    }
    Ok(())
}

/// Overlay `additional` onto `base`; keys in `additional` win.
fn merge_keys_from(
    base: Option<BTreeMap<String, String>>,
    additional: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = base.unwrap_or_default();
    merged.extend(additional.unwrap_or_default());
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

fn remove_field(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cursor = value;
    for seg in parents {
        match cursor.get_mut(seg) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(map) = cursor.as_object_mut() {
        map.remove(*last);
    }
}

/// Semantic sub-tree check: every element present in `patch` must be present
/// and equal in `base`; `base` may carry more.
fn is_derivative(patch: &Value, base: &Value) -> bool {
    match (patch, base) {
        (Value::Null, _) => true,
        (Value::Object(p), Value::Object(b)) => p
            .iter()
            .all(|(k, v)| match b.get(k) {
                Some(bv) => is_derivative(v, bv),
                None => v.is_null(),
            }),
        (Value::Array(p), Value::Array(b)) => {
            p.len() <= b.len() && p.iter().zip(b.iter()).all(|(pv, bv)| is_derivative(pv, bv))
        }
        (p, b) => p == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derivative_ignores_extra_base_fields() {
        let patch = json!({"spec": {"replicas": 1, "labels": {"a": "1"}}});
        let base = json!({"spec": {"replicas": 1, "labels": {"a": "1", "b": "2"}}, "extra": true});
        assert!(is_derivative(&patch, &base));
    }

    #[test]
    fn derivative_detects_scalar_drift() {
        let patch = json!({"spec": {"replicas": 2}});
        let base = json!({"spec": {"replicas": 1}});
        assert!(!is_derivative(&patch, &base));
    }

    #[test]
    fn derivative_detects_missing_keys() {
        let patch = json!({"spec": {"replicas": 1}});
        let base = json!({"metadata": {}});
        assert!(!is_derivative(&patch, &base));
    }

    #[test]
    fn derivative_arrays_compare_positionally() {
        let patch = json!({"a": [1, 2]});
        assert!(is_derivative(&patch, &json!({"a": [1, 2, 3]})));
        assert!(!is_derivative(&patch, &json!({"a": [2, 1]})));
        assert!(!is_derivative(&json!({"a": [1, 2, 3]}), &json!({"a": [1, 2]})));
    }

    #[test]
    fn derivative_treats_null_as_absent() {
        let patch = json!({"spec": {"optional": null}});
        let base = json!({"spec": {}});
        assert!(is_derivative(&patch, &base));
    }

    #[test]
    fn merge_prefers_additional_keys() {
        let base = BTreeMap::from([("a".to_string(), "old".to_string()), ("keep".to_string(), "1".to_string())]);
        let add = BTreeMap::from([("a".to_string(), "new".to_string())]);
        let merged = merge_keys_from(Some(base), Some(add)).unwrap();
        assert_eq!(merged.get("a").map(String::as_str), Some("new"));
        assert_eq!(merged.get("keep").map(String::as_str), Some("1"));
        assert_eq!(merge_keys_from(None, None), None);
    }

    #[test]
    fn remove_field_handles_missing_paths() {
        let mut v = json!({"metadata": {"ownerReferences": [], "name": "a"}});
        remove_field(&mut v, &["metadata", "ownerReferences"]);
        remove_field(&mut v, &["status"]);
        assert_eq!(v, json!({"metadata": {"name": "a"}}));
    }
}
