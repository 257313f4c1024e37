//! Convoy phase reconciler – drives the objects of one phase towards their
//! desired state, adopting them across revisions and tearing them down in
//! reverse.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::core::DynamicObject;
use tracing::{debug, info};

use convoy_apis::{ConditionMapping, ObjectSetTemplatePhase, PhaseObject};
use convoy_cache::{CacheError, ObjectCache, OwnerKey, Writer};
use convoy_core::{conditions, gvk_of, set_cache_label, ObjectKey};
use convoy_owners::{
    set_object_revision, AdoptionChecker, OwnerError, OwnerStrategy, PreviousOwner,
};

mod owner;
mod patcher;
pub mod preflight;
pub mod probe;

pub use owner::{ClusterObjectSetOwner, ObjectSetOwner, PhaseOwner};
pub use preflight::{PhasePreflight, PreflightChecker, Violation};
pub use probe::{ConditionProber, NoopProber, Prober};

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("preflight: {}", violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    Preflight { violations: Vec<Violation> },

    #[error(transparent)]
    Owner(#[from] OwnerError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("invalid phase object: {0}")]
    InvalidObject(String),

    #[error("parsing conditions of {object}: {source}")]
    ConditionParse { object: String, source: serde_json::Error },
}

/// Outcome of probing all objects of a phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbingResult {
    pub phase_name: String,
    pub failed_probes: Vec<String>,
}

impl ProbingResult {
    pub fn is_zero(&self) -> bool {
        self.phase_name.is_empty() && self.failed_probes.is_empty()
    }
}

impl std::fmt::Display for ProbingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Phase {:?} failed: {}", self.phase_name, self.failed_probes.join(", "))
    }
}

/// Reconciles the objects of one phase on behalf of a [`PhaseOwner`].
///
/// Reads only ever come from the dynamic cache; all mutations go through the
/// writer.
pub struct PhaseReconciler {
    cache: Arc<dyn ObjectCache>,
    writer: Arc<dyn Writer>,
    strategy: OwnerStrategy,
    adoption: AdoptionChecker,
    preflight: Arc<dyn PreflightChecker>,
}

impl PhaseReconciler {
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        writer: Arc<dyn Writer>,
        preflight: Arc<dyn PreflightChecker>,
    ) -> Self {
        let strategy = OwnerStrategy;
        Self { cache, writer, strategy, adoption: AdoptionChecker::from_env(strategy), preflight }
    }

    /// Test/override constructor with an explicit adoption checker.
    pub fn with_adoption(
        cache: Arc<dyn ObjectCache>,
        writer: Arc<dyn Writer>,
        preflight: Arc<dyn PreflightChecker>,
        adoption: AdoptionChecker,
    ) -> Self {
        Self { cache, writer, strategy: OwnerStrategy, adoption, preflight }
    }

    /// Reconcile all objects of `phase` in declared order.
    ///
    /// Returns the actual (live) objects and the probing outcome. Preflight
    /// violations and adoption refusals abort the phase without mutation of
    /// the remaining objects.
    pub async fn reconcile_phase(
        &self,
        owner: &mut dyn PhaseOwner,
        phase: &ObjectSetTemplatePhase,
        probe: &dyn Prober,
        previous: &[PreviousOwner],
    ) -> Result<(Vec<DynamicObject>, ProbingResult), PhaseError> {
        let violations = self.preflight.check(owner.client_object(), phase)?;
        if !violations.is_empty() {
            return Err(PhaseError::Preflight { violations });
        }

        let mut actual = Vec::with_capacity(phase.objects.len());
        let mut failed_probes = Vec::new();
        for phase_object in &phase.objects {
            let actual_obj = self.reconcile_phase_object(owner, phase_object, previous).await?;

            let (success, message) = probe.probe(&actual_obj);
            if !success {
                let (group, kind) = gvk_of(&actual_obj).map(|g| (g.group, g.kind)).unwrap_or_default();
                failed_probes.push(format!(
                    "{} {} {}: {}",
                    group,
                    kind,
                    ObjectKey::from_object(&actual_obj),
                    message
                ));
            }
            actual.push(actual_obj);
        }

        let result = if failed_probes.is_empty() {
            ProbingResult::default()
        } else {
            ProbingResult { phase_name: phase.name.clone(), failed_probes }
        };
        Ok((actual, result))
    }

    /// Tear the phase down. Returns true once every object is gone or
    /// released; callers requeue while false.
    pub async fn teardown_phase(
        &self,
        owner: &dyn PhaseOwner,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<bool, PhaseError> {
        let mut cleanup_count = 0usize;
        for phase_object in &phase.objects {
            if self.teardown_phase_object(owner, phase_object).await? {
                cleanup_count += 1;
            }
        }
        Ok(cleanup_count == phase.objects.len())
    }

    async fn teardown_phase_object(
        &self,
        owner: &dyn PhaseOwner,
        phase_object: &PhaseObject,
    ) -> Result<bool, PhaseError> {
        let desired = self.desired_object(owner, phase_object)?;
        let gvk = gvk_of(&desired)
            .ok_or_else(|| PhaseError::InvalidObject("phase object carries no apiVersion/kind".into()))?;
        let owner_key = owner_key(owner)?;

        // Also watch during teardown: after a restart mid-deletion the cache
        // for this kind may not exist anymore.
        self.cache.watch(&owner_key, &gvk).await?;

        let key = ObjectKey::from_object(&desired);
        let current = match self.cache.get(&gvk, &key) {
            Ok(obj) => obj,
            // Whoever owned it, it is already gone.
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        if !self.strategy.is_controller(owner.client_object(), &current) {
            // Owned by someone else; just drop our reference.
            let mut released = current;
            self.strategy.remove_owner(owner.client_object(), &mut released);
            self.writer.update(&released).await?;
            return Ok(true);
        }

        match self.writer.delete(&current).await {
            Ok(()) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile_phase_object(
        &self,
        owner: &mut dyn PhaseOwner,
        phase_object: &PhaseObject,
        previous: &[PreviousOwner],
    ) -> Result<DynamicObject, PhaseError> {
        let desired = self.desired_object(owner, phase_object)?;
        let gvk = gvk_of(&desired)
            .ok_or_else(|| PhaseError::InvalidObject("phase object carries no apiVersion/kind".into()))?;
        let owner_key = owner_key(owner)?;

        self.cache.watch(&owner_key, &gvk).await?;

        if owner.is_paused() {
            // Read-through only; a paused owner never mutates.
            let key = ObjectKey::from_object(&desired);
            return Ok(self.cache.get(&gvk, &key)?);
        }

        let actual = self.reconcile_object(owner, &desired, previous).await?;
        self.map_conditions(owner, &phase_object.condition_mappings, &actual)?;
        Ok(actual)
    }

    async fn reconcile_object(
        &self,
        owner: &dyn PhaseOwner,
        desired: &DynamicObject,
        previous: &[PreviousOwner],
    ) -> Result<DynamicObject, PhaseError> {
        let gvk = gvk_of(desired)
            .ok_or_else(|| PhaseError::InvalidObject("phase object carries no apiVersion/kind".into()))?;
        let key = ObjectKey::from_object(desired);
        let current = match self.cache.get(&gvk, &key) {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                // Not on the cluster yet; create from desired state.
                let created = self.writer.create(desired).await?;
                debug!(key = %key, kind = %gvk.kind, "created phase object");
                return Ok(created);
            }
            Err(e) => return Err(e.into()),
        };

        // An object already exists - this is the complicated part.
        let mut updated = current.clone();

        let needs_adoption =
            self.adoption.check(owner.client_object(), owner.revision(), &current, previous)?;
        if needs_adoption {
            info!(
                owner = %ObjectKey::from_object(owner.client_object()),
                object = %key,
                kind = %gvk.kind,
                "adopting object"
            );
            set_object_revision(&mut updated, owner.revision());
            self.strategy.release_controller(&mut updated);
            self.strategy.set_controller_reference(owner.client_object(), &mut updated)?;

            let owner_patch = self.strategy.owner_patch(&updated);
            self.writer.patch_merge(&updated, owner_patch).await?;
        }

        // Only converge spec once this owner controls the object.
        if self.strategy.is_controller(owner.client_object(), &updated) {
            patcher::patch(self.writer.as_ref(), desired, &current, &updated).await?;
        }

        Ok(updated)
    }

    /// Build the desired object as specified in the phase: owner namespace,
    /// cache label, revision annotation and controller reference.
    fn desired_object(
        &self,
        owner: &dyn PhaseOwner,
        phase_object: &PhaseObject,
    ) -> Result<DynamicObject, PhaseError> {
        let mut desired: DynamicObject = serde_json::from_value(phase_object.object.clone())
            .map_err(|e| PhaseError::InvalidObject(e.to_string()))?;

        if let Some(ns) = owner.client_object().metadata.namespace.as_deref() {
            desired.metadata.namespace = Some(ns.to_string());
        }
        set_cache_label(&mut desired);
        set_object_revision(&mut desired, owner.revision());
        self.strategy.set_controller_reference(owner.client_object(), &mut desired)?;
        Ok(desired)
    }

    /// Copy mapped, current-generation conditions of the actual object onto
    /// the owner.
    fn map_conditions(
        &self,
        owner: &mut dyn PhaseOwner,
        mappings: &[ConditionMapping],
        actual: &DynamicObject,
    ) -> Result<(), PhaseError> {
        if mappings.is_empty() {
            return Ok(());
        }
        let object_conditions = match conditions::object_conditions(actual).map_err(|source| {
            PhaseError::ConditionParse { object: ObjectKey::from_object(actual).to_string(), source }
        })? {
            Some(conds) => conds,
            None => return Ok(()),
        };

        let generation = actual.metadata.generation.unwrap_or(0);
        let owner_generation = owner.client_object().metadata.generation;
        for condition in object_conditions {
            let observed = condition.observed_generation.unwrap_or(0);
            if observed != 0 && observed != generation {
                // Condition is outdated.
                continue;
            }
            let Some(mapping) = mappings.iter().find(|m| m.source_type == condition.type_) else {
                continue;
            };
            conditions::set_condition(
                owner.conditions_mut(),
                conditions::new_condition(
                    &mapping.destination_type,
                    &condition.status,
                    &condition.reason,
                    &condition.message,
                    owner_generation,
                ),
            );
        }
        Ok(())
    }
}

fn owner_key(owner: &dyn PhaseOwner) -> Result<OwnerKey, PhaseError> {
    OwnerKey::from_dynamic(owner.client_object())
        .ok_or_else(|| PhaseError::InvalidObject("owner carries no type metadata or name".into()))
}
