//! Write seam shared by all reconcilers.

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Client,
};
use metrics::counter;
use tracing::debug;

use convoy_core::{gvk_of, ObjectKey, FIELD_MANAGER};

use crate::{discovery::resolve_api_resource, CacheError};

/// Cluster mutations used by reconcilers. Safe for concurrent use; every
/// method resolves its own Api handle.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, CacheError>;
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, CacheError>;
    /// Delete; `NotFound` is surfaced so callers can treat it as done.
    async fn delete(&self, obj: &DynamicObject) -> Result<(), CacheError>;
    async fn patch_merge(&self, obj: &DynamicObject, body: serde_json::Value) -> Result<(), CacheError>;
    /// Server-side apply under the convoy field manager with force-ownership.
    async fn patch_apply(&self, obj: &DynamicObject, body: serde_json::Value) -> Result<(), CacheError>;
}

pub struct KubeWriter {
    client: Client,
}

impl KubeWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn api_for(&self, obj: &DynamicObject) -> Result<Api<DynamicObject>, CacheError> {
        let gvk = gvk_of(obj)
            .ok_or_else(|| CacheError::InvalidObject("object carries no type metadata".into()))?;
        let (ar, namespaced) = resolve_api_resource(self.client.clone(), &gvk).await?;
        let api = if namespaced {
            match obj.metadata.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => {
                    return Err(CacheError::InvalidObject(format!(
                        "namespace required for namespaced kind {}",
                        gvk.kind
                    )))
                }
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }

    fn name_of(obj: &DynamicObject) -> Result<String, CacheError> {
        obj.metadata
            .name
            .clone()
            .ok_or_else(|| CacheError::InvalidObject("object has no name".into()))
    }
}

fn map_not_found(err: kube::Error, obj: &DynamicObject) -> CacheError {
    if let kube::Error::Api(ref ae) = err {
        if ae.code == 404 {
            let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
            return CacheError::NotFound { kind, key: ObjectKey::from_object(obj).to_string() };
        }
    }
    CacheError::Kube(err)
}

#[async_trait]
impl Writer for KubeWriter {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, CacheError> {
        let api = self.api_for(obj).await?;
        let created = api.create(&PostParams::default(), obj).await?;
        counter!("write_create_total", 1u64);
        debug!(key = %ObjectKey::from_object(obj), "created object");
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, CacheError> {
        let api = self.api_for(obj).await?;
        let name = Self::name_of(obj)?;
        let updated = api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_not_found(e, obj))?;
        counter!("write_update_total", 1u64);
        Ok(updated)
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<(), CacheError> {
        let api = self.api_for(obj).await?;
        let name = Self::name_of(obj)?;
        api.delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| map_not_found(e, obj))?;
        counter!("write_delete_total", 1u64);
        Ok(())
    }

    async fn patch_merge(&self, obj: &DynamicObject, body: serde_json::Value) -> Result<(), CacheError> {
        let api = self.api_for(obj).await?;
        let name = Self::name_of(obj)?;
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_not_found(e, obj))?;
        counter!("write_patch_total", 1u64);
        Ok(())
    }

    async fn patch_apply(&self, obj: &DynamicObject, body: serde_json::Value) -> Result<(), CacheError> {
        let api = self.api_for(obj).await?;
        let name = Self::name_of(obj)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(&body))
            .await
            .map_err(|e| map_not_found(e, obj))?;
        counter!("write_apply_total", 1u64);
        Ok(())
    }
}
