//! Preflight contract: checks run against a phase before any mutation.

use kube::core::DynamicObject;

use convoy_apis::ObjectSetTemplatePhase;

use crate::PhaseError;

/// A single rejected aspect of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Where the violation was found, e.g. `phase deploy, object [0]`.
    pub position: String,
    pub error: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.position, self.error)
    }
}

/// Violations are reported in bulk; any violation blocks the whole phase.
pub trait PreflightChecker: Send + Sync {
    fn check(
        &self,
        owner: &DynamicObject,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<Vec<Violation>, PhaseError>;
}

/// Baseline checks every phase has to pass: objects must carry apiVersion,
/// kind and a name, and a namespaced owner cannot place objects outside its
/// own namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhasePreflight;

impl PreflightChecker for PhasePreflight {
    fn check(
        &self,
        owner: &DynamicObject,
        phase: &ObjectSetTemplatePhase,
    ) -> Result<Vec<Violation>, PhaseError> {
        let owner_namespace = owner.metadata.namespace.as_deref();
        let mut violations = Vec::new();
        for (idx, phase_object) in phase.objects.iter().enumerate() {
            let position = format!("phase {}, object [{}]", phase.name, idx);
            let object = &phase_object.object;

            if object.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("").is_empty()
                || object.get("kind").and_then(|v| v.as_str()).unwrap_or("").is_empty()
            {
                violations.push(Violation {
                    position: position.clone(),
                    error: "apiVersion and kind are required".to_string(),
                });
            }

            if object
                .get("metadata")
                .and_then(|m| m.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .is_empty()
            {
                violations.push(Violation {
                    position: position.clone(),
                    error: "metadata.name is required".to_string(),
                });
            }

            let object_namespace =
                object.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
            if let (Some(owner_ns), Some(obj_ns)) = (owner_namespace, object_namespace) {
                if owner_ns != obj_ns {
                    violations.push(Violation {
                        position,
                        error: format!(
                            "object namespace {obj_ns:?} escapes owner namespace {owner_ns:?}"
                        ),
                    });
                }
            }
        }
        Ok(violations)
    }
}

/// Skips all checks; composition point for externally supplied rule sets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPreflight;

impl PreflightChecker for NoopPreflight {
    fn check(
        &self,
        _owner: &DynamicObject,
        _phase: &ObjectSetTemplatePhase,
    ) -> Result<Vec<Violation>, PhaseError> {
        Ok(Vec::new())
    }
}
