//! Owner capability set and its two concrete adapters.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::core::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};

use convoy_apis::{ClusterObjectSet, ObjectSet};

/// Capability set every phase-reconciling owner provides. Namespaced and
/// cluster-scoped owners share it; reconcilers never see the concrete type.
pub trait PhaseOwner: Send + Sync {
    /// Unstructured projection of the owner used for owner references and
    /// cache registration.
    fn client_object(&self) -> &DynamicObject;
    fn revision(&self) -> i64;
    fn is_paused(&self) -> bool;
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

fn project<K>(resource: &K) -> DynamicObject
where
    K: Resource<DynamicType = ()>,
{
    let ar = ApiResource::erase::<K>(&());
    let mut object = DynamicObject::new(&resource.name_any(), &ar);
    object.metadata = resource.meta().clone();
    object
}

/// Namespaced owner adapter.
pub struct ObjectSetOwner {
    object: DynamicObject,
    revision: i64,
    paused: bool,
    conditions: Vec<Condition>,
}

impl ObjectSetOwner {
    pub fn new(set: &ObjectSet) -> Self {
        Self {
            object: project(set),
            revision: set.status.as_ref().and_then(|s| s.revision).unwrap_or(0),
            paused: set.spec.paused,
            conditions: set.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(),
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Hand the (possibly updated) condition list back for a status write.
    pub fn into_conditions(self) -> Vec<Condition> {
        self.conditions
    }
}

impl PhaseOwner for ObjectSetOwner {
    fn client_object(&self) -> &DynamicObject {
        &self.object
    }

    fn revision(&self) -> i64 {
        self.revision
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Cluster-scoped owner adapter.
pub struct ClusterObjectSetOwner {
    object: DynamicObject,
    revision: i64,
    paused: bool,
    conditions: Vec<Condition>,
}

impl ClusterObjectSetOwner {
    pub fn new(set: &ClusterObjectSet) -> Self {
        Self {
            object: project(set),
            revision: set.status.as_ref().and_then(|s| s.revision).unwrap_or(0),
            paused: set.spec.paused,
            conditions: set.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default(),
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn into_conditions(self) -> Vec<Condition> {
        self.conditions
    }
}

impl PhaseOwner for ClusterObjectSetOwner {
    fn client_object(&self) -> &DynamicObject {
        &self.object
    }

    fn revision(&self) -> i64 {
        self.revision
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}
