//! Convoy hosted-cluster controller – provisions a remote-phase manager
//! Package once an externally managed HostedCluster reports Available.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::{debug, info};

use convoy_apis::{condition_types, Package, PackageSpec};
use convoy_core::{conditions, ObjectKey, CACHE_LABEL, CACHE_LABEL_VALUE};

/// The watched external kind. Not part of the local type registry; handled
/// as unstructured data throughout.
pub const HOSTED_CLUSTER_GROUP: &str = "hypershift.openshift.io";
pub const HOSTED_CLUSTER_VERSION: &str = "v1alpha1";
pub const HOSTED_CLUSTER_KIND: &str = "HostedCluster";

pub fn hosted_cluster_gvk() -> GroupVersionKind {
    GroupVersionKind {
        group: HOSTED_CLUSTER_GROUP.to_string(),
        version: HOSTED_CLUSTER_VERSION.to_string(),
        kind: HOSTED_CLUSTER_KIND.to_string(),
    }
}

pub fn hosted_cluster_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&hosted_cluster_gvk(), "hostedclusters")
}

#[derive(Debug, thiserror::Error)]
pub enum HostedError {
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid hosted cluster: {0}")]
    InvalidObject(String),
}

pub struct HostedClusterController {
    client: Client,
    image: String,
}

impl HostedClusterController {
    /// `image` is the configured remote-phase manager package image.
    pub fn new(client: Client, image: String) -> Self {
        Self { client, image }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), HostedError> {
        let namespace = key
            .namespace
            .as_deref()
            .ok_or_else(|| HostedError::InvalidObject("hosted cluster without namespace".into()))?;
        let ar = hosted_cluster_api_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let Some(cluster) = api.get_opt(&key.name).await? else {
            return Ok(());
        };

        if !is_available(&cluster) {
            debug!(cluster = %key, "hosted cluster not available yet");
            return Ok(());
        }

        let package = desired_package(&cluster, &self.image)?;
        let packages: Api<Package> = Api::namespaced(self.client.clone(), namespace);
        let name = package.metadata.name.as_deref().unwrap_or_default();
        if packages.get_opt(name).await?.is_none() {
            packages.create(&PostParams::default(), &package).await?;
            info!(cluster = %key, package = %name, "remote phase manager package created");
        }
        Ok(())
    }
}

/// `status.conditions` must report `Available=True`.
pub fn is_available(cluster: &DynamicObject) -> bool {
    match conditions::object_conditions(cluster) {
        Ok(Some(conds)) => conditions::is_condition_true(&conds, condition_types::AVAILABLE),
        _ => false,
    }
}

/// The remote-phase manager Package for a hosted cluster, controlled by the
/// cluster through an explicitly constructed owner reference.
pub fn desired_package(cluster: &DynamicObject, image: &str) -> Result<Package, HostedError> {
    let cluster_name = cluster
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| HostedError::InvalidObject("hosted cluster without name".into()))?;
    let uid = cluster
        .metadata
        .uid
        .clone()
        .ok_or_else(|| HostedError::InvalidObject("hosted cluster without uid".into()))?;

    let mut package = Package::new(
        &format!("{cluster_name}_remote_phase_manager"),
        PackageSpec { image: image.to_string() },
    );
    package.metadata.namespace = cluster.metadata.namespace.clone();
    package
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(CACHE_LABEL.to_string(), CACHE_LABEL_VALUE.to_string());

    // The HostedCluster type is not registered locally, so the reference is
    // assembled by hand instead of derived from a typed owner.
    let reference = OwnerReference {
        api_version: format!("{HOSTED_CLUSTER_GROUP}/{HOSTED_CLUSTER_VERSION}"),
        kind: HOSTED_CLUSTER_KIND.to_string(),
        name: cluster_name.to_string(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    };
    package.metadata.owner_references = Some(vec![reference]);
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosted_cluster(available: Option<&str>) -> DynamicObject {
        let mut value = serde_json::json!({
            "apiVersion": "hypershift.openshift.io/v1alpha1",
            "kind": "HostedCluster",
            "metadata": {"name": "tenant-1", "namespace": "clusters", "uid": "uid-hc"}
        });
        if let Some(status) = available {
            value["status"] = serde_json::json!({
                "conditions": [{
                    "type": "Available",
                    "status": status,
                    "reason": "Test",
                    "message": "",
                    "lastTransitionTime": "2023-01-01T00:00:00Z"
                }]
            });
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn availability_requires_the_condition() {
        assert!(is_available(&hosted_cluster(Some("True"))));
        assert!(!is_available(&hosted_cluster(Some("False"))));
        assert!(!is_available(&hosted_cluster(None)));
    }

    #[test]
    fn desired_package_shape() {
        let pkg = desired_package(&hosted_cluster(Some("True")), "quay.io/convoy/remote-phase:v1")
            .unwrap();
        assert_eq!(pkg.metadata.name.as_deref(), Some("tenant-1_remote_phase_manager"));
        assert_eq!(pkg.metadata.namespace.as_deref(), Some("clusters"));
        assert_eq!(pkg.spec.image, "quay.io/convoy/remote-phase:v1");
        assert_eq!(
            pkg.metadata.labels.as_ref().unwrap().get(CACHE_LABEL).map(String::as_str),
            Some("True")
        );
        let refs = pkg.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "HostedCluster");
        assert_eq!(refs[0].uid, "uid-hc");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn missing_uid_is_rejected() {
        let mut cluster = hosted_cluster(Some("True"));
        cluster.metadata.uid = None;
        assert!(matches!(
            desired_package(&cluster, "img"),
            Err(HostedError::InvalidObject(_))
        ));
    }
}
