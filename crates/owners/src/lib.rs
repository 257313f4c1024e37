//! Convoy owner handling – controller references, revision annotations and
//! the cross-revision adoption protocol.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::Resource;

use convoy_apis::{RemotePhaseReference, CLUSTER_OBJECT_SET_PHASE_KIND, GROUP, OBJECT_SET_PHASE_KIND, VERSION};
use convoy_core::{gvk_of, ObjectKey, FORCE_ADOPTION_ENV, REVISION_ANNOTATION};

#[derive(Debug, thiserror::Error)]
pub enum OwnerError {
    #[error("object {object} already controlled by a different owner (uid {uid})")]
    AlreadyOwned { object: String, uid: String },

    #[error("malformed revision annotation {value:?} on {object}")]
    MalformedRevision { object: String, value: String },

    #[error("refusing adoption, object {object} not owned by previous revision (owner {owner})")]
    NotOwnedByPreviousRevision { owner: String, object: String },

    #[error("refusing adoption, revision collision on {object} (owner {owner})")]
    RevisionCollision { owner: String, object: String },

    #[error("owner {0} carries no uid or type metadata")]
    IncompleteOwner(String),
}

fn describe(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("<unknown>");
    format!("{} {}", kind, ObjectKey::from_object(obj))
}

/// Owner-reference manipulation on unstructured objects.
///
/// The controller slot (`controller=true`) is exclusive; non-controller
/// references are shared with previous revisions until tear-down.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerStrategy;

impl OwnerStrategy {
    /// True iff `obj` carries a reference with `controller=true` and the
    /// owner's uid.
    pub fn is_controller(&self, owner: &DynamicObject, obj: &DynamicObject) -> bool {
        let owner_uid = match owner.metadata.uid.as_deref() {
            Some(uid) => uid,
            None => return false,
        };
        obj.metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|r| r.controller == Some(true) && r.uid == owner_uid)
    }

    /// Clear `controller=true` on every reference without removing any.
    pub fn release_controller(&self, obj: &mut DynamicObject) {
        if let Some(refs) = obj.metadata.owner_references.as_mut() {
            for r in refs.iter_mut() {
                r.controller = Some(false);
            }
        }
    }

    /// Drop any reference carrying the owner's uid.
    pub fn remove_owner(&self, owner: &DynamicObject, obj: &mut DynamicObject) {
        let owner_uid = owner.metadata.uid.clone().unwrap_or_default();
        if let Some(refs) = obj.metadata.owner_references.as_mut() {
            refs.retain(|r| r.uid != owner_uid);
            if refs.is_empty() {
                obj.metadata.owner_references = None;
            }
        }
    }

    /// Claim the controller slot for `owner`. Fails when another uid already
    /// holds it; an existing reference for the same uid is promoted in place.
    pub fn set_controller_reference(
        &self,
        owner: &DynamicObject,
        obj: &mut DynamicObject,
    ) -> Result<(), OwnerError> {
        let owner_uid = owner
            .metadata
            .uid
            .clone()
            .ok_or_else(|| OwnerError::IncompleteOwner(describe(owner)))?;
        let gvk = gvk_of(owner).ok_or_else(|| OwnerError::IncompleteOwner(describe(owner)))?;
        let reference = OwnerReference {
            api_version: owner.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default(),
            kind: gvk.kind,
            name: owner.metadata.name.clone().unwrap_or_default(),
            uid: owner_uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        self.set_controller_reference_raw(reference, obj)
    }

    /// Variant for owners whose kind is not locally registered; the caller
    /// supplies the complete reference.
    pub fn set_controller_reference_raw(
        &self,
        reference: OwnerReference,
        obj: &mut DynamicObject,
    ) -> Result<(), OwnerError> {
        let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
        if let Some(existing) = refs
            .iter()
            .find(|r| r.controller == Some(true) && r.uid != reference.uid)
        {
            return Err(OwnerError::AlreadyOwned {
                object: ObjectKey::new(obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or_default()).to_string(),
                uid: existing.uid.clone(),
            });
        }
        match refs.iter_mut().find(|r| r.uid == reference.uid) {
            Some(existing) => *existing = reference,
            None => refs.push(reference),
        }
        Ok(())
    }

    /// Merge-patch body carrying the object's owner-reference list verbatim.
    pub fn owner_patch(&self, obj: &DynamicObject) -> serde_json::Value {
        let refs = obj.metadata.owner_references.clone().unwrap_or_default();
        serde_json::json!({
            "metadata": {
                "ownerReferences": serde_json::to_value(refs).unwrap_or_default(),
            }
        })
    }
}

/// Build an owner reference for a locally registered typed resource.
pub fn owner_reference_for<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.meta().name.clone()?,
        uid: owner.meta().uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

// ------------- revision annotation -------------

/// Revision number from the well-known annotation. Absent means 0.
pub fn object_revision(obj: &DynamicObject) -> Result<i64, OwnerError> {
    let value = match obj.metadata.annotations.as_ref().and_then(|a| a.get(REVISION_ANNOTATION)) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(0),
    };
    value.parse::<i64>().map_err(|_| OwnerError::MalformedRevision {
        object: describe(obj),
        value: value.clone(),
    })
}

pub fn set_object_revision(obj: &mut DynamicObject, revision: i64) {
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
}

// ------------- adoption -------------

/// Reference to a previous revision of an owner, plus the remote-phase
/// delegates that acted on its behalf. Used only to authorize adoption.
#[derive(Debug, Clone)]
pub struct PreviousOwner {
    pub object: DynamicObject,
    pub remote_phases: Vec<RemotePhaseReference>,
}

impl PreviousOwner {
    pub fn new(object: DynamicObject) -> Self {
        Self { object, remote_phases: Vec::new() }
    }

    pub fn with_remote_phases(object: DynamicObject, remote_phases: Vec<RemotePhaseReference>) -> Self {
        Self { object, remote_phases }
    }
}

/// Decides whether an ownership change onto the reconciling owner is needed.
#[derive(Debug, Clone, Copy)]
pub struct AdoptionChecker {
    strategy: OwnerStrategy,
    force: bool,
}

impl AdoptionChecker {
    pub fn new(strategy: OwnerStrategy, force: bool) -> Self {
        Self { strategy, force }
    }

    /// Reads the force-adoption escape hatch from the environment. Forced
    /// adoption bypasses the previous-revision safety protocol entirely.
    pub fn from_env(strategy: OwnerStrategy) -> Self {
        let force = std::env::var(FORCE_ADOPTION_ENV).map(|v| !v.is_empty()).unwrap_or(false);
        Self::new(strategy, force)
    }

    /// Adoption decision for live object `obj` under `owner` at
    /// `owner_revision`, authorized by the `previous` revision list.
    pub fn check(
        &self,
        owner: &DynamicObject,
        owner_revision: i64,
        obj: &DynamicObject,
        previous: &[PreviousOwner],
    ) -> Result<bool, OwnerError> {
        if self.force {
            return Ok(true);
        }

        if self.strategy.is_controller(owner, obj) {
            return Ok(false);
        }

        let current_revision = object_revision(obj)?;
        if current_revision > owner_revision {
            // Owned by a newer revision; never steal downwards.
            return Ok(false);
        }

        if !self.controlled_by_previous(obj, previous) {
            return Err(OwnerError::NotOwnedByPreviousRevision {
                owner: describe(owner),
                object: describe(obj),
            });
        }

        if current_revision == owner_revision {
            // Same revision but not already ours: two owners claim the slot.
            return Err(OwnerError::RevisionCollision {
                owner: describe(owner),
                object: describe(obj),
            });
        }

        Ok(true)
    }

    fn controlled_by_previous(&self, obj: &DynamicObject, previous: &[PreviousOwner]) -> bool {
        for prev in previous {
            if self.strategy.is_controller(&prev.object, obj) {
                return true;
            }

            if prev.remote_phases.is_empty() {
                continue;
            }
            let prev_kind = prev.object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
            let remote_kind = if prev_kind.starts_with("Cluster") {
                CLUSTER_OBJECT_SET_PHASE_KIND
            } else {
                OBJECT_SET_PHASE_KIND
            };
            for remote in &prev.remote_phases {
                let delegate = synthetic_owner(
                    remote_kind,
                    prev.object.metadata.namespace.as_deref(),
                    &remote.name,
                    &remote.uid,
                );
                if self.strategy.is_controller(&delegate, obj) {
                    return true;
                }
            }
        }
        false
    }
}

fn synthetic_owner(kind: &str, namespace: Option<&str>, name: &str, uid: &str) -> DynamicObject {
    let ar = kube::core::ApiResource {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        api_version: format!("{GROUP}/{VERSION}"),
        kind: kind.to_string(),
        plural: String::new(),
    };
    let mut delegate = DynamicObject::new(name, &ar);
    delegate.metadata.uid = Some(uid.to_string());
    delegate.metadata.namespace = namespace.map(|s| s.to_string());
    delegate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).unwrap()
    }

    fn owner(name: &str, uid: &str, revision: i64) -> (DynamicObject, i64) {
        let o = obj(serde_json::json!({
            "apiVersion": "convoy.run/v1alpha1",
            "kind": "ObjectSet",
            "metadata": {"name": name, "namespace": "default", "uid": uid}
        }));
        (o, revision)
    }

    fn configmap(controller_uid: Option<&str>, revision: Option<i64>) -> DynamicObject {
        let mut value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "default"}
        });
        if let Some(uid) = controller_uid {
            value["metadata"]["ownerReferences"] = serde_json::json!([{
                "apiVersion": "convoy.run/v1alpha1",
                "kind": "ObjectSet",
                "name": "previous",
                "uid": uid,
                "controller": true,
                "blockOwnerDeletion": true
            }]);
        }
        if let Some(rev) = revision {
            value["metadata"]["annotations"] =
                serde_json::json!({ "convoy.run/revision": rev.to_string() });
        }
        obj(value)
    }

    #[test]
    fn controller_slot_round_trip() {
        let strategy = OwnerStrategy;
        let (set, _) = owner("set-a", "uid-a", 1);
        let mut cm = configmap(None, None);

        assert!(!strategy.is_controller(&set, &cm));
        strategy.set_controller_reference(&set, &mut cm).unwrap();
        assert!(strategy.is_controller(&set, &cm));

        strategy.release_controller(&mut cm);
        assert!(!strategy.is_controller(&set, &cm));
        assert_eq!(cm.metadata.owner_references.as_ref().unwrap().len(), 1);

        strategy.remove_owner(&set, &mut cm);
        assert!(cm.metadata.owner_references.is_none());
    }

    #[test]
    fn controller_slot_is_exclusive() {
        let strategy = OwnerStrategy;
        let (a, _) = owner("set-a", "uid-a", 1);
        let (b, _) = owner("set-b", "uid-b", 2);
        let mut cm = configmap(None, None);

        strategy.set_controller_reference(&a, &mut cm).unwrap();
        let err = strategy.set_controller_reference(&b, &mut cm).unwrap_err();
        assert!(matches!(err, OwnerError::AlreadyOwned { .. }));

        // After releasing, the new owner can claim the slot and the old
        // reference stays behind without the controller flag.
        strategy.release_controller(&mut cm);
        strategy.set_controller_reference(&b, &mut cm).unwrap();
        assert!(strategy.is_controller(&b, &cm));
        let refs = cm.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs.iter().filter(|r| r.controller == Some(true)).count(), 1);
    }

    #[test]
    fn owner_patch_carries_reference_list() {
        let strategy = OwnerStrategy;
        let (set, _) = owner("set-a", "uid-a", 1);
        let mut cm = configmap(None, None);
        strategy.set_controller_reference(&set, &mut cm).unwrap();

        let patch = strategy.owner_patch(&cm);
        let refs = patch["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "uid-a");
        assert_eq!(refs[0]["controller"], true);
    }

    #[test]
    fn revision_annotation_parsing() {
        assert_eq!(object_revision(&configmap(None, None)).unwrap(), 0);
        assert_eq!(object_revision(&configmap(None, Some(7))).unwrap(), 7);

        let mut bad = configmap(None, None);
        bad.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(REVISION_ANNOTATION.to_string(), "not-a-number".to_string());
        assert!(matches!(object_revision(&bad), Err(OwnerError::MalformedRevision { .. })));

        let mut stamped = configmap(None, None);
        set_object_revision(&mut stamped, 42);
        assert_eq!(object_revision(&stamped).unwrap(), 42);
    }

    #[test]
    fn adoption_noop_when_already_controller() {
        let checker = AdoptionChecker::new(OwnerStrategy, false);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let cm = configmap(Some("uid-a"), Some(3));
        assert!(!checker.check(&set, rev, &cm, &[]).unwrap());
    }

    #[test]
    fn adoption_noop_when_newer_revision_owns() {
        let checker = AdoptionChecker::new(OwnerStrategy, false);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let cm = configmap(Some("uid-x"), Some(4));
        assert!(!checker.check(&set, rev, &cm, &[]).unwrap());
    }

    #[test]
    fn adoption_refused_without_previous_owner() {
        let checker = AdoptionChecker::new(OwnerStrategy, false);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let cm = configmap(Some("uid-stranger"), Some(2));
        let err = checker.check(&set, rev, &cm, &[]).unwrap_err();
        assert!(matches!(err, OwnerError::NotOwnedByPreviousRevision { .. }));
    }

    #[test]
    fn adoption_refused_on_revision_collision() {
        let checker = AdoptionChecker::new(OwnerStrategy, false);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let (prev, _) = owner("previous", "uid-prev", 3);
        let cm = configmap(Some("uid-prev"), Some(3));
        let err = checker.check(&set, rev, &cm, &[PreviousOwner::new(prev)]).unwrap_err();
        assert!(matches!(err, OwnerError::RevisionCollision { .. }));
    }

    #[test]
    fn adoption_from_previous_revision() {
        let checker = AdoptionChecker::new(OwnerStrategy, false);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let (prev, _) = owner("previous", "uid-prev", 2);
        let cm = configmap(Some("uid-prev"), Some(2));
        assert!(checker.check(&set, rev, &cm, &[PreviousOwner::new(prev)]).unwrap());
    }

    #[test]
    fn adoption_through_remote_phase_delegate() {
        let checker = AdoptionChecker::new(OwnerStrategy, false);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let (prev, _) = owner("previous", "uid-prev", 2);

        // Object controlled by the delegate phase, not the set itself.
        let mut cm = configmap(None, Some(2));
        cm.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "convoy.run/v1alpha1".to_string(),
            kind: "ObjectSetPhase".to_string(),
            name: "previous-deploy".to_string(),
            uid: "uid-remote".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);

        let previous = PreviousOwner::with_remote_phases(
            prev,
            vec![RemotePhaseReference { name: "previous-deploy".into(), uid: "uid-remote".into() }],
        );
        assert!(checker.check(&set, rev, &cm, &[previous]).unwrap());
    }

    #[test]
    fn forced_adoption_bypasses_protocol() {
        let checker = AdoptionChecker::new(OwnerStrategy, true);
        let (set, rev) = owner("set-a", "uid-a", 3);
        let cm = configmap(Some("uid-stranger"), Some(9));
        assert!(checker.check(&set, rev, &cm, &[]).unwrap());
    }
}
