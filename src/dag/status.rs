//! Status conditions recorded while the graph is built.
//!
//! Processors write into a [`StatusAccumulator`] passed alongside the graph.
//! When the build finishes the accumulator is turned into one
//! [`StatusUpdate`] per object that any processor looked at.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::k8s::ObjectKey;

pub const CONDITION_VALID: &str = "Valid";
pub const CONDITION_ACCEPTED: &str = "Accepted";
pub const CONDITION_RESOLVED_REFS: &str = "ResolvedRefs";
pub const CONDITION_PROGRAMMED: &str = "Programmed";

pub const ROUTE_ERROR: &str = "RouteError";
pub const REASON_ROUTE_CONFLICT: &str = "RouteConflict";

/// Conditions that make an object invalid when they are `False`.
const POSITIVE_CONDITIONS: &[&str] =
    &[CONDITION_VALID, CONDITION_ACCEPTED, CONDITION_RESOLVED_REFS, CONDITION_PROGRAMMED];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One `(type, status, reason, message)` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// An error sub-condition. Errors are always `True`: the error is present.
    pub fn error(condition_type: &str, reason: &str, message: impl Into<String>) -> Self {
        Self::new(condition_type, ConditionStatus::True, reason, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ValidityState {
    Valid,
    Invalid,
    Orphaned,
}

impl fmt::Display for ValidityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidityState::Valid => "valid",
            ValidityState::Invalid => "invalid",
            ValidityState::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
struct ObjectStatus {
    errors: Vec<Condition>,
    warnings: Vec<Condition>,
    orphaned: bool,
    conditions: BTreeMap<String, Vec<Condition>>,
}

/// Final status of one object after a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub key: ObjectKey,
    pub state: ValidityState,
    pub description: String,
    pub errors: Vec<Condition>,
    pub warnings: Vec<Condition>,
    /// Conditions grouped by scope. The empty scope holds object-wide
    /// conditions; Gateway API routes use one scope per parent reference.
    pub conditions: BTreeMap<String, Vec<Condition>>,
}

impl StatusUpdate {
    pub fn is_valid(&self) -> bool {
        self.state == ValidityState::Valid
    }

    /// Find a condition by scope and type.
    pub fn condition(&self, scope: &str, condition_type: &str) -> Option<&Condition> {
        self.conditions.get(scope)?.iter().find(|c| c.condition_type == condition_type)
    }

    /// Find an error by type and reason.
    pub fn has_error(&self, condition_type: &str, reason: &str) -> bool {
        self.errors.iter().any(|e| e.condition_type == condition_type && e.reason == reason)
    }
}

/// Collects conditions for every object touched during a build.
#[derive(Debug, Default)]
pub struct StatusAccumulator {
    entries: BTreeMap<ObjectKey, ObjectStatus>,
}

impl StatusAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, key: &ObjectKey) -> &mut ObjectStatus {
        self.entries.entry(key.clone()).or_default()
    }

    /// Record that an object was processed. Objects with no further
    /// conditions end up valid.
    pub fn touch(&mut self, key: &ObjectKey) {
        self.entry(key);
    }

    pub fn add_error(
        &mut self,
        key: &ObjectKey,
        condition_type: &str,
        reason: &str,
        message: impl Into<String>,
    ) {
        let condition = Condition::error(condition_type, reason, message);
        let status = self.entry(key);
        if !status.errors.contains(&condition) {
            status.errors.push(condition);
        }
    }

    pub fn add_warning(
        &mut self,
        key: &ObjectKey,
        condition_type: &str,
        reason: &str,
        message: impl Into<String>,
    ) {
        let condition = Condition::error(condition_type, reason, message);
        let status = self.entry(key);
        if !status.warnings.contains(&condition) {
            status.warnings.push(condition);
        }
    }

    pub fn set_orphaned(&mut self, key: &ObjectKey) {
        self.entry(key).orphaned = true;
    }

    /// Set a condition in `scope`, replacing any previous condition of the
    /// same type there.
    pub fn set_condition(&mut self, key: &ObjectKey, scope: &str, condition: Condition) {
        let conditions = self.entry(key).conditions.entry(scope.to_string()).or_default();
        match conditions.iter_mut().find(|c| c.condition_type == condition.condition_type) {
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }
    }

    /// Current condition of `condition_type` in `scope`, if set.
    pub fn condition(&self, key: &ObjectKey, scope: &str, condition_type: &str) -> Option<&Condition> {
        self.entries
            .get(key)?
            .conditions
            .get(scope)?
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn has_errors(&self, key: &ObjectKey) -> bool {
        self.entries.get(key).map(|s| !s.errors.is_empty()).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finish the build and derive each object's state.
    pub fn into_updates(self) -> Vec<StatusUpdate> {
        self.entries
            .into_iter()
            .map(|(key, status)| {
                let failed = status.conditions.values().flatten().find(|c| {
                    c.status == ConditionStatus::False
                        && POSITIVE_CONDITIONS.contains(&c.condition_type.as_str())
                });
                let (state, description) = if let Some(error) = status.errors.first() {
                    (ValidityState::Invalid, error.message.clone())
                } else if let Some(condition) = failed {
                    (ValidityState::Invalid, condition.message.clone())
                } else if status.orphaned {
                    (
                        ValidityState::Orphaned,
                        format!(
                            "this {} is not part of a delegation chain from a root {}",
                            key.kind, key.kind
                        ),
                    )
                } else {
                    (ValidityState::Valid, format!("valid {}", key.kind))
                };
                StatusUpdate {
                    key,
                    state,
                    description,
                    errors: status.errors,
                    warnings: status.warnings,
                    conditions: status.conditions,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::Kind;

    #[test]
    fn derived_states() {
        let valid = ObjectKey::new(Kind::HTTPProxy, "default", "valid");
        let invalid = ObjectKey::new(Kind::HTTPProxy, "default", "invalid");
        let orphan = ObjectKey::new(Kind::HTTPProxy, "default", "orphan");
        let route = ObjectKey::new(Kind::HTTPRoute, "default", "route");

        let mut status = StatusAccumulator::new();
        status.touch(&valid);
        status.add_error(&invalid, "PrefixReplaceError", "AmbiguousReplacement", "ambiguous prefix replacement");
        status.set_orphaned(&orphan);
        status.set_condition(
            &route,
            "projectcontour/contour",
            Condition::new(CONDITION_ACCEPTED, ConditionStatus::True, "Accepted", "Accepted HTTPRoute"),
        );
        status.set_condition(
            &route,
            "projectcontour/contour",
            Condition::new(CONDITION_ACCEPTED, ConditionStatus::False, "RouteConflict", "conflict"),
        );

        let updates = status.into_updates();
        let by_name = |name: &str| updates.iter().find(|u| u.key.name == name).unwrap();

        assert_eq!(by_name("valid").state, ValidityState::Valid);
        assert_eq!(by_name("valid").description, "valid HTTPProxy");
        assert_eq!(by_name("invalid").state, ValidityState::Invalid);
        assert_eq!(by_name("invalid").description, "ambiguous prefix replacement");
        assert!(by_name("invalid").has_error("PrefixReplaceError", "AmbiguousReplacement"));
        assert_eq!(by_name("orphan").state, ValidityState::Orphaned);
        let route = by_name("route");
        assert_eq!(route.state, ValidityState::Invalid);
        assert_eq!(route.conditions["projectcontour/contour"].len(), 1);
        assert_eq!(
            route.condition("projectcontour/contour", CONDITION_ACCEPTED).unwrap().reason,
            "RouteConflict"
        );
    }

    #[test]
    fn duplicate_errors_are_recorded_once() {
        let key = ObjectKey::new(Kind::Ingress, "default", "i");
        let mut status = StatusAccumulator::new();
        status.add_error(&key, "TLSError", "SecretNotValid", "bad secret");
        status.add_error(&key, "TLSError", "SecretNotValid", "bad secret");
        assert_eq!(status.into_updates()[0].errors.len(), 1);
    }
}
