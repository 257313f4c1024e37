//! Convoy template controller – renders a manifest template over values
//! sourced from live cluster objects and converges the resulting object.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use convoy_apis::{
    condition_types, ClusterObjectTemplate, ObjectTemplate, ObjectTemplateStatus, StatusPhase,
    TemplateSource, TemplateSourceItem,
};
use convoy_cache::{resolve_api_resource, CacheError, ObjectCache, OwnerKey};
use convoy_core::{conditions, gvk_of, set_cache_label, ObjectKey, REVISION_ANNOTATION};
use convoy_owners::{owner_reference_for, set_object_revision, OwnerError, OwnerStrategy};

mod finalizer;

pub use finalizer::{ensure_cached_finalizer, free_cache_and_remove_finalizer};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("source {source_name} references namespace {declared}, conflicting with owner namespace {owner}")]
    NamespaceMismatch { source_name: String, declared: String, owner: String },

    #[error("neither the owner nor source {source_name} provides a namespace")]
    MissingNamespace { source_name: String },

    #[error("source object {source_name} not found: {key}")]
    SourceNotFound { source_name: String, key: String },

    #[error("source object {source_name} has no value at {path}")]
    MissingKey { source_name: String, path: String },

    #[error("duplicate destination at {0}")]
    DuplicateDestination(String),

    #[error("rendering template: {0}")]
    Render(#[from] minijinja::Error),

    #[error("decoding rendered template: {0}")]
    Decode(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Owner(#[from] OwnerError),

    #[error("kube: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TemplateError {
    /// Errors caused by the owner's own configuration. They surface as an
    /// Invalid condition instead of plain requeue-noise.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TemplateError::NamespaceMismatch { .. }
                | TemplateError::MissingNamespace { .. }
                | TemplateError::SourceNotFound { .. }
                | TemplateError::MissingKey { .. }
                | TemplateError::DuplicateDestination(_)
                | TemplateError::Render(_)
                | TemplateError::Decode(_)
        )
    }

    fn reason(&self) -> &'static str {
        match self {
            TemplateError::NamespaceMismatch { .. }
            | TemplateError::MissingNamespace { .. }
            | TemplateError::SourceNotFound { .. }
            | TemplateError::MissingKey { .. } => "SourceError",
            TemplateError::DuplicateDestination(_) => "DuplicateDestination",
            TemplateError::Render(_) => "TemplateError",
            TemplateError::Decode(_) => "DecodeError",
            _ => "ReconcileError",
        }
    }
}

/// Capability set shared by the namespaced and cluster-scoped template
/// owners.
pub trait TemplateOwner:
    Resource<DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
    fn template(&self) -> &str;
    fn sources(&self) -> &[TemplateSource];
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn set_phase(&mut self, phase: StatusPhase);
    fn status_body(&self) -> Value;
}

impl TemplateOwner for ObjectTemplate {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        }
    }

    fn template(&self) -> &str {
        &self.spec.template
    }

    fn sources(&self) -> &[TemplateSource] {
        &self.spec.sources
    }

    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(ObjectTemplateStatus::default).conditions
    }

    fn set_phase(&mut self, phase: StatusPhase) {
        self.status.get_or_insert_with(ObjectTemplateStatus::default).phase = phase;
    }

    fn status_body(&self) -> Value {
        serde_json::json!({ "status": self.status })
    }
}

impl TemplateOwner for ClusterObjectTemplate {
    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }

    fn template(&self) -> &str {
        &self.spec.template
    }

    fn sources(&self) -> &[TemplateSource] {
        &self.spec.sources
    }

    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(ObjectTemplateStatus::default).conditions
    }

    fn set_phase(&mut self, phase: StatusPhase) {
        self.status.get_or_insert_with(ObjectTemplateStatus::default).phase = phase;
    }

    fn status_body(&self) -> Value {
        serde_json::json!({ "status": self.status })
    }
}

/// Reconciles one template owner end to end.
pub struct TemplateReconciler<T: TemplateOwner> {
    client: Client,
    cache: Arc<dyn ObjectCache>,
    _owner: PhantomData<T>,
}

impl<T: TemplateOwner> TemplateReconciler<T> {
    pub fn new(client: Client, cache: Arc<dyn ObjectCache>) -> Self {
        Self { client, cache, _owner: PhantomData }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<(), TemplateError> {
        let api = T::api(self.client.clone(), key.namespace.as_deref());
        let Some(mut owner) = api.get_opt(&key.name).await? else {
            // Late events after finalizer removal; nothing left to do.
            return Ok(());
        };

        if owner.meta().deletion_timestamp.is_some() {
            free_cache_and_remove_finalizer(&api, &owner, self.cache.as_ref()).await?;
            info!(owner = %key, "template owner released");
            return Ok(());
        }
        ensure_cached_finalizer(&api, &owner).await?;

        match self.reconcile_template(&mut owner).await {
            Ok(live) => {
                conditions::remove_condition(owner.conditions_mut(), condition_types::INVALID);
                if let Some(live) = live {
                    mirror_conditions(&mut owner, &live);
                }
                self.update_status(&api, &key.name, &mut owner).await?;
                debug!(owner = %key, "template reconciled");
                Ok(())
            }
            Err(e) if e.is_config_error() => {
                let generation = owner.meta().generation;
                conditions::set_condition(
                    owner.conditions_mut(),
                    conditions::new_condition(
                        condition_types::INVALID,
                        "True",
                        e.reason(),
                        &e.to_string(),
                        generation,
                    ),
                );
                self.update_status(&api, &key.name, &mut owner).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve sources, render, decode and converge the templated object.
    /// Returns the pre-update live object when one existed.
    async fn reconcile_template(&self, owner: &mut T) -> Result<Option<DynamicObject>, TemplateError> {
        let values = self.resolve_sources(owner).await?;
        let desired = desired_object(owner, &values)?;
        self.converge(desired).await
    }

    /// Build the source-value map by copying values from fetched source
    /// objects into their declared destinations.
    async fn resolve_sources(&self, owner: &T) -> Result<Value, TemplateError> {
        let owner_key = OwnerKey::from_resource(owner);
        let owner_namespace = owner.meta().namespace.clone();
        let mut values = serde_json::json!({});
        for source in owner.sources() {
            let (gvk, key) = source_target(owner_namespace.as_deref(), source)?;
            self.cache.watch(&owner_key, &gvk).await?;

            let source_obj = match self.cache.get(&gvk, &key) {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() && source.optional => continue,
                Err(e) if e.is_not_found() => {
                    return Err(TemplateError::SourceNotFound {
                        source_name: source.name.clone(),
                        key: key.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            };

            let source_value = serde_json::to_value(&source_obj)?;
            copy_source_values(&mut values, &source_value, &source.items, &source.name)?;
        }
        Ok(values)
    }

    async fn converge(&self, desired: DynamicObject) -> Result<Option<DynamicObject>, TemplateError> {
        let gvk = gvk_of(&desired)
            .ok_or_else(|| TemplateError::Decode("rendered object carries no apiVersion/kind".into()))?;
        let (ar, namespaced) = resolve_api_resource(self.client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match desired.metadata.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => {
                    return Err(TemplateError::Decode(format!(
                        "namespace required for namespaced kind {}",
                        gvk.kind
                    )))
                }
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };

        let name = desired
            .metadata
            .name
            .clone()
            .ok_or_else(|| TemplateError::Decode("rendered object carries no name".into()))?;
        match api.get_opt(&name).await? {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!(key = %ObjectKey::from_object(&desired), kind = %gvk.kind, "templated object created");
                Ok(None)
            }
            Some(existing) => {
                if semantic_changed(&existing, &desired)? {
                    let mut replacement = desired;
                    replacement.metadata.resource_version = existing.metadata.resource_version.clone();
                    api.replace(&name, &PostParams::default(), &replacement).await?;
                    debug!(name = %name, "templated object updated");
                }
                Ok(Some(existing))
            }
        }
    }

    async fn update_status(
        &self,
        api: &Api<T>,
        name: &str,
        owner: &mut T,
    ) -> Result<(), TemplateError> {
        owner.set_phase(compute_phase(owner.conditions()));
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&owner.status_body()))
            .await?;
        Ok(())
    }
}

/// Copy the well-known conditions of the templated object onto the owner,
/// stamped against the owner's generation.
fn mirror_conditions<T: TemplateOwner>(owner: &mut T, live: &DynamicObject) {
    let Ok(Some(live_conditions)) = conditions::object_conditions(live) else { return };
    let generation = owner.meta().generation;
    for type_ in [
        condition_types::AVAILABLE,
        condition_types::PROGRESSING,
        condition_types::UNPACKED,
        condition_types::INVALID,
    ] {
        if let Some(cond) = conditions::find_condition(&live_conditions, type_) {
            conditions::set_condition(
                owner.conditions_mut(),
                conditions::new_condition(type_, &cond.status, &cond.reason, &cond.message, generation),
            );
        }
    }
}

/// Status phase ladder: Invalid > Unpacking > Progressing > Available >
/// NotReady.
pub fn compute_phase(conds: &[Condition]) -> StatusPhase {
    if conditions::is_condition_true(conds, condition_types::INVALID) {
        return StatusPhase::Invalid;
    }
    if conditions::find_condition(conds, condition_types::UNPACKED).is_none() {
        return StatusPhase::Unpacking;
    }
    if conditions::is_condition_true(conds, condition_types::PROGRESSING) {
        return StatusPhase::Progressing;
    }
    if conditions::is_condition_true(conds, condition_types::AVAILABLE) {
        return StatusPhase::Available;
    }
    StatusPhase::NotReady
}

/// Render the owner's template over the source-value map and decorate the
/// decoded object: owner namespace, cache label, revision annotation and
/// controller reference. Template owners carry no revision counter of their
/// own, so the owner's generation stamps the annotation.
fn desired_object<T: TemplateOwner>(owner: &T, values: &Value) -> Result<DynamicObject, TemplateError> {
    let rendered = render_template(owner.template(), values)?;
    let mut desired = decode_rendered(&rendered)?;

    if let Some(ns) = owner.meta().namespace.as_deref() {
        desired.metadata.namespace = Some(ns.to_string());
    }
    set_cache_label(&mut desired);
    set_object_revision(&mut desired, owner.meta().generation.unwrap_or(0));
    let reference = owner_reference_for(owner)
        .ok_or_else(|| TemplateError::Decode("owner carries no name or uid".into()))?;
    OwnerStrategy.set_controller_reference_raw(reference, &mut desired)?;
    Ok(desired)
}

/// Namespace resolution for a source declaration.
///
/// A namespaced owner pins sources to its own namespace; a cluster-scoped
/// owner requires each source to declare one.
fn source_target(
    owner_namespace: Option<&str>,
    source: &TemplateSource,
) -> Result<(GroupVersionKind, ObjectKey), TemplateError> {
    let (group, version) = match source.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), source.api_version.clone()),
    };
    let gvk = GroupVersionKind { group, version, kind: source.kind.clone() };

    let namespace = match (owner_namespace, source.namespace.as_deref()) {
        (Some(owner_ns), Some(declared)) if owner_ns != declared => {
            return Err(TemplateError::NamespaceMismatch {
                source_name: source.name.clone(),
                declared: declared.to_string(),
                owner: owner_ns.to_string(),
            })
        }
        (Some(owner_ns), _) => owner_ns.to_string(),
        (None, Some(declared)) => declared.to_string(),
        (None, None) => {
            return Err(TemplateError::MissingNamespace { source_name: source.name.clone() })
        }
    };

    Ok((gvk, ObjectKey::new(Some(&namespace), &source.name)))
}

/// Deep-copy each item's value into its destination path. Destinations are
/// exclusive within one reconcile.
fn copy_source_values(
    values: &mut Value,
    source_obj: &Value,
    items: &[TemplateSourceItem],
    source_name: &str,
) -> Result<(), TemplateError> {
    for item in items {
        let value = json_path_get(source_obj, &item.key).ok_or_else(|| TemplateError::MissingKey {
            source_name: source_name.to_string(),
            path: item.key.clone(),
        })?;
        if json_path_get(values, &item.destination).is_some() {
            return Err(TemplateError::DuplicateDestination(item.destination.clone()));
        }
        json_path_set(values, &item.destination, value.clone())?;
    }
    Ok(())
}

/// Walk a dot-separated path through nested mappings.
fn json_path_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = value;
    for seg in path.split('.') {
        cursor = cursor.get(seg)?;
    }
    Some(cursor)
}

fn json_path_set(target: &mut Value, path: &str, value: Value) -> Result<(), TemplateError> {
    let mut cursor = target;
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) =
        segments.split_last().ok_or_else(|| TemplateError::DuplicateDestination(path.into()))?;
    for seg in parents {
        let map = cursor
            .as_object_mut()
            .ok_or_else(|| TemplateError::DuplicateDestination(path.to_string()))?;
        cursor = map.entry(seg.to_string()).or_insert_with(|| serde_json::json!({}));
    }
    let map = cursor
        .as_object_mut()
        .ok_or_else(|| TemplateError::DuplicateDestination(path.to_string()))?;
    map.insert(last.to_string(), value);
    Ok(())
}

/// Render the manifest template with the source-value map exposed as
/// `config`. Rendering is deterministic given (template, sources).
pub fn render_template(template: &str, values: &Value) -> Result<String, TemplateError> {
    let mut env = minijinja::Environment::new();
    env.add_template("object", template)?;
    let tmpl = env.get_template("object")?;
    Ok(tmpl.render(minijinja::context! { config => values })?)
}

/// Decode rendered output into exactly one managed-object document.
pub fn decode_rendered(rendered: &str) -> Result<DynamicObject, TemplateError> {
    let value: Value = serde_yaml::from_str(rendered).map_err(|e| TemplateError::Decode(e.to_string()))?;
    if !value.is_object() {
        return Err(TemplateError::Decode("rendered template is not a mapping".into()));
    }
    let obj: DynamicObject =
        serde_json::from_value(value).map_err(|e| TemplateError::Decode(e.to_string()))?;
    if obj.types.is_none() {
        return Err(TemplateError::Decode("rendered object carries no apiVersion/kind".into()));
    }
    if obj.metadata.name.is_none() {
        return Err(TemplateError::Decode("rendered object carries no metadata.name".into()));
    }
    Ok(obj)
}

/// Compare ignoring server-managed metadata, status and the revision
/// annotation.
fn semantic_changed(existing: &DynamicObject, desired: &DynamicObject) -> Result<bool, TemplateError> {
    let strip = |obj: &DynamicObject| -> Result<Value, TemplateError> {
        let mut v = serde_json::to_value(obj)?;
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
            meta.remove("resourceVersion");
            meta.remove("generation");
            meta.remove("creationTimestamp");
            meta.remove("uid");
            if let Some(annotations) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
                annotations.remove(REVISION_ANNOTATION);
                if annotations.is_empty() {
                    meta.remove("annotations");
                }
            }
        }
        if let Some(obj) = v.as_object_mut() {
            obj.remove("status");
        }
        Ok(v)
    };
    Ok(strip(existing)? != strip(desired)?)
}

#[cfg(test)]
mod tests;
