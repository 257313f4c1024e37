//! Status-condition bookkeeping with type-unique keys.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::core::DynamicObject;

/// Insert or replace the condition with the same `type`.
///
/// `lastTransitionTime` only moves when `status` actually changes; replacing
/// a condition with an identical status keeps the previous transition time.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    if new.last_transition_time.0.timestamp() == 0 {
        new.last_transition_time = Time(Utc::now());
    }
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.status == "True").unwrap_or(false)
}

/// Read `status.conditions` off an unstructured object.
///
/// Returns `Ok(None)` when the object has no conditions; a present but
/// malformed list is an error.
pub fn object_conditions(obj: &DynamicObject) -> Result<Option<Vec<Condition>>, serde_json::Error> {
    let raw = match obj.data.get("status").and_then(|s| s.get("conditions")) {
        Some(raw) => raw.clone(),
        None => return Ok(None),
    };
    serde_json::from_value(raw).map(Some)
}

/// Build a condition stamped against the given generation.
pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}
