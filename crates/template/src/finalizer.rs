//! Cached finalizer handling: the finalizer guards dynamic-cache
//! registrations and is only removed after Free completed.

use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use tracing::debug;

use convoy_cache::{ObjectCache, OwnerKey};
use convoy_core::CACHED_FINALIZER;

use crate::{TemplateError, TemplateOwner};

/// Idempotently append the cached finalizer to the owner.
pub async fn ensure_cached_finalizer<T: TemplateOwner>(
    api: &Api<T>,
    owner: &T,
) -> Result<(), TemplateError> {
    if owner.finalizers().iter().any(|f| f == CACHED_FINALIZER) {
        return Ok(());
    }
    let mut finalizers = owner.finalizers().to_vec();
    finalizers.push(CACHED_FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&owner.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
    debug!(owner = %owner.name_any(), "cached finalizer added");
    Ok(())
}

/// Release all dynamic-cache registrations of the owner, then drop the
/// finalizer so deletion can proceed.
pub async fn free_cache_and_remove_finalizer<T: TemplateOwner>(
    api: &Api<T>,
    owner: &T,
    cache: &dyn ObjectCache,
) -> Result<(), TemplateError> {
    cache.free(&OwnerKey::from_resource(owner)).await?;

    if !owner.finalizers().iter().any(|f| f == CACHED_FINALIZER) {
        return Ok(());
    }
    let finalizers: Vec<String> =
        owner.finalizers().iter().filter(|f| *f != CACHED_FINALIZER).cloned().collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&owner.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
    debug!(owner = %owner.name_any(), "cached finalizer removed");
    Ok(())
}
