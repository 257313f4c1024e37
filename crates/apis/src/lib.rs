//! Convoy API types – declarative resources consumed and produced by the
//! reconciliation engine.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of all convoy resources.
pub const GROUP: &str = "convoy.run";
pub const VERSION: &str = "v1alpha1";

/// Kinds of the remote-phase delegate objects referenced by previous
/// revisions. Not served locally; used to build synthetic owners during
/// adoption checks.
pub const OBJECT_SET_PHASE_KIND: &str = "ObjectSetPhase";
pub const CLUSTER_OBJECT_SET_PHASE_KIND: &str = "ClusterObjectSetPhase";

/// Well-known condition types.
pub mod condition_types {
    pub const AVAILABLE: &str = "Available";
    pub const PROGRESSING: &str = "Progressing";
    pub const UNPACKED: &str = "Unpacked";
    pub const INVALID: &str = "Invalid";
    pub const PAUSED: &str = "Paused";
}

/// Status phase for kubectl printing; condition lists are the API contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StatusPhase {
    #[default]
    Pending,
    Invalid,
    Unpacking,
    Progressing,
    Available,
    NotReady,
}

// ------------- ObjectTemplate -------------

/// ObjectTemplate renders a text template into a single managed object,
/// with template values copied out of other live cluster objects.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "convoy.run",
    version = "v1alpha1",
    kind = "ObjectTemplate",
    plural = "objecttemplates",
    namespaced,
    status = "ObjectTemplateStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplateSpec {
    /// Template of a Kubernetes manifest in minijinja syntax.
    pub template: String,

    /// Objects from which configuration parameters are fetched.
    #[serde(default)]
    pub sources: Vec<TemplateSource>,
}

/// Cluster-scoped variant of ObjectTemplate.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "convoy.run",
    version = "v1alpha1",
    kind = "ClusterObjectTemplate",
    plural = "clusterobjecttemplates",
    status = "ObjectTemplateStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectTemplateSpec {
    pub template: String,

    #[serde(default)]
    pub sources: Vec<TemplateSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSource {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub items: Vec<TemplateSourceItem>,
    /// Optional sources that are not found are skipped instead of failing
    /// the reconcile; they are picked up once they appear.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSourceItem {
    /// Dot-separated path of the value in the source object.
    pub key: String,
    /// Dot-separated path under which the value is exposed to the template.
    pub destination: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: StatusPhase,
}

// ------------- Package -------------

/// Package points at a packaged set of objects to be unpacked and
/// reconciled in-cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "convoy.run",
    version = "v1alpha1",
    kind = "Package",
    plural = "packages",
    namespaced,
    status = "PackageStatus",
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    /// Container image carrying the package contents.
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub phase: StatusPhase,
}

// ------------- ObjectSet -------------

/// ObjectSet reconciles a revision of a package: an ordered list of phases,
/// each enumerating desired objects.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "convoy.run",
    version = "v1alpha1",
    kind = "ObjectSet",
    plural = "objectsets",
    namespaced,
    status = "ObjectSetStatus",
    printcolumn = r#"{"name":"Revision", "type":"integer", "jsonPath":".status.revision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetSpec {
    /// Pauses reconciliation; objects are still read and reported.
    #[serde(default)]
    pub paused: bool,

    pub phases: Vec<ObjectSetTemplatePhase>,

    /// Previous revisions of this ObjectSet, authorizing adoption of their
    /// objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PreviousRevisionReference>,
}

/// Cluster-scoped variant of ObjectSet.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "convoy.run",
    version = "v1alpha1",
    kind = "ClusterObjectSet",
    plural = "clusterobjectsets",
    status = "ObjectSetStatus",
    printcolumn = r#"{"name":"Revision", "type":"integer", "jsonPath":".status.revision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterObjectSetSpec {
    #[serde(default)]
    pub paused: bool,

    pub phases: Vec<ObjectSetTemplatePhase>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous: Vec<PreviousRevisionReference>,
}

/// One phase of an object set: objects reconciled together and torn down in
/// reverse phase order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetTemplatePhase {
    pub name: String,
    pub objects: Vec<PhaseObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseObject {
    /// Full manifest of the desired object.
    pub object: serde_json::Value,

    /// Conditions copied from the live object onto the owner.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition_mappings: Vec<ConditionMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionMapping {
    /// Condition type on the watched object.
    pub source_type: String,
    /// Condition type written onto the owner.
    pub destination_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviousRevisionReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Computed revision number, inherited and incremented across the
    /// previous list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,

    /// Phases delegated to remote-phase managers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_phases: Vec<RemotePhaseReference>,
}

/// Reference to an (Cluster)ObjectSetPhase delegate managing a phase on
/// behalf of an object set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemotePhaseReference {
    pub name: String,
    pub uid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_template_spec_round_trips() {
        let spec: ObjectTemplateSpec = serde_json::from_value(serde_json::json!({
            "template": "apiVersion: v1",
            "sources": [{
                "apiVersion": "v1",
                "kind": "Secret",
                "name": "db-credentials",
                "items": [{"key": "data.password", "destination": "db.password"}],
                "optional": true
            }]
        }))
        .unwrap();
        assert_eq!(spec.sources.len(), 1);
        assert!(spec.sources[0].optional);
        assert_eq!(spec.sources[0].items[0].destination, "db.password");
    }

    #[test]
    fn phase_objects_accept_arbitrary_manifests() {
        let phase: ObjectSetTemplatePhase = serde_json::from_value(serde_json::json!({
            "name": "deploy",
            "objects": [{
                "object": {
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "a"}
                },
                "conditionMappings": [
                    {"sourceType": "Ready", "destinationType": "convoy.run/Ready"}
                ]
            }]
        }))
        .unwrap();
        assert_eq!(phase.objects[0].condition_mappings[0].destination_type, "convoy.run/Ready");
    }

    #[test]
    fn status_phase_defaults_to_pending() {
        let status: ObjectTemplateStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.phase, StatusPhase::Pending);
    }
}
