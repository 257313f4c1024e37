//! Probe contract: a predicate over an object's live state.

use kube::core::DynamicObject;

use convoy_core::conditions::object_conditions;

/// Success plus a human-readable message on failure.
pub trait Prober: Send + Sync {
    fn probe(&self, obj: &DynamicObject) -> (bool, String);
}

/// Accepts everything. Used when a phase declares no availability probes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProber;

impl Prober for NoopProber {
    fn probe(&self, _obj: &DynamicObject) -> (bool, String) {
        (true, String::new())
    }
}

/// Probes for a status condition with the given type being "True" at the
/// object's current generation.
#[derive(Debug, Clone)]
pub struct ConditionProber {
    pub condition_type: String,
}

impl ConditionProber {
    pub fn new(condition_type: &str) -> Self {
        Self { condition_type: condition_type.to_string() }
    }
}

impl Prober for ConditionProber {
    fn probe(&self, obj: &DynamicObject) -> (bool, String) {
        let conds = match object_conditions(obj) {
            Ok(Some(conds)) => conds,
            Ok(None) => {
                return (false, format!("missing condition {:?}", self.condition_type));
            }
            Err(e) => return (false, format!("malformed conditions: {e}")),
        };

        let generation = obj.metadata.generation.unwrap_or(0);
        let Some(cond) = conds.iter().find(|c| c.type_ == self.condition_type) else {
            return (false, format!("missing condition {:?}", self.condition_type));
        };
        let observed = cond.observed_generation.unwrap_or(0);
        if observed != 0 && observed != generation {
            return (false, format!("condition {:?} outdated", self.condition_type));
        }
        if cond.status != "True" {
            return (
                false,
                format!("condition {:?} is {:?}: {}", self.condition_type, cond.status, cond.message),
            );
        }
        (true, String::new())
    }
}
