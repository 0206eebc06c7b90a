//! Check request and decision types.
//!
//! `CheckInput` is what callers hand to the engine; `CheckResult` is the
//! structured decision that comes back, carrying per-action effects with
//! their policy provenance, the activated derived roles, any attribute
//! validation errors, rule outputs, and the evaluation trace.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::policy::Effect;

/// A single authorization check: one principal, one resource instance,
/// one or more actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CheckInput {
    /// Caller-supplied request identifier, echoed back in the result and
    /// suitable for audit correlation.
    pub request_id: String,

    pub principal: Principal,

    pub resource: Resource,

    /// Actions to decide; each receives an independent effect.
    pub actions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_data: Option<AuxData>,
}

/// The acting subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Principal {
    pub id: String,

    /// Overrides the engine's configured default policy version for
    /// principal-policy lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,

    /// Scope the principal-policy walk starts from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    pub roles: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attr: BTreeMap<String, serde_json::Value>,
}

/// The object of the actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Resource {
    /// Resource kind, matched against resource policies and principal-rule
    /// resource globs.
    pub kind: String,

    pub id: String,

    /// Overrides the engine's configured default policy version for
    /// resource-policy lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,

    /// Scope the resource-policy walk starts from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attr: BTreeMap<String, serde_json::Value>,
}

/// Auxiliary request data, surfaced to conditions as `request.auxData`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuxData {
    /// JWT claims, claim name to value, available as
    /// `request.auxData.jwt.<claim>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jwt: BTreeMap<String, serde_json::Value>,
}

/// The decision for one `CheckInput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub request_id: String,

    pub resource: ResourceIdentifier,

    /// Effect and provenance per requested action.
    pub actions: BTreeMap<String, ActionEffect>,

    /// Derived-role names whose activation conditions held, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective_derived_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<AttrValidationError>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputEntry>,

    /// Step-by-step record of how the decision was reached.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceEvent>,
}

/// Echo of the resource the decision applies to, with the version and scope
/// that were actually used for lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    pub kind: String,
    pub policy_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

/// The effect decided for one action, with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEffect {
    pub effect: Effect,

    /// Identifier of the policy that produced the effect, or `NO_MATCH`.
    pub policy: String,

    /// Scope of the matching rule, when the policy is scoped.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

/// Which attribute bag a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationSource {
    Principal,
    Resource,
}

/// One attribute-schema violation attached to a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrValidationError {
    pub source: ValidationSource,
    /// JSON pointer-ish path into the offending attribute document.
    pub path: String,
    pub message: String,
}

/// The value produced by a rule's output expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEntry {
    /// `<policy-id>#<rule-index>` of the producing rule.
    pub src: String,
    pub val: serde_json::Value,
}

/// One step in the evaluation trace.
///
/// Trace entries are append-only and deterministic: identical input under
/// an identical snapshot yields an identical trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TraceEvent {
    /// A policy in the scope chain was consulted.
    ScopeEntered { policy: String },
    /// A derived role's parent roles intersected and its condition held.
    DerivedRoleActivated { role: String },
    /// A derived role was considered but not activated.
    DerivedRoleSkipped { role: String, reason: String },
    /// A rule matched and produced the action's effect.
    RuleMatched {
        policy: String,
        rule: String,
        action: String,
        effect: Effect,
    },
    /// A rule was considered but did not apply.
    RuleSkipped {
        policy: String,
        rule: String,
        reason: String,
    },
    /// A rule's condition raised an evaluation error; the rule was treated
    /// as non-matching.
    RuleErrored {
        policy: String,
        rule: String,
        error: String,
    },
    /// An output expression raised an evaluation error; the effect stands.
    OutputErrored { src: String, error: String },
    /// No rule matched the action anywhere in the chain.
    DefaultDenied { action: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_input_decodes_from_wire_json() {
        let input: CheckInput = serde_json::from_value(json!({
            "requestId": "req-001",
            "principal": {
                "id": "sally",
                "policyVersion": "20210210",
                "roles": ["employee", "manager"],
                "attr": { "department": "marketing" }
            },
            "resource": {
                "kind": "leave_request",
                "id": "XX125",
                "policyVersion": "20210210",
                "attr": { "status": "PENDING_APPROVAL" }
            },
            "actions": ["approve", "view:public"],
            "auxData": { "jwt": { "iss": "arbiter-test" } }
        }))
        .unwrap();

        assert_eq!(input.principal.roles, vec!["employee", "manager"]);
        assert_eq!(input.actions.len(), 2);
        assert_eq!(
            input.aux_data.unwrap().jwt.get("iss"),
            Some(&json!("arbiter-test"))
        );
    }

    #[test]
    fn action_effect_serializes_without_empty_scope() {
        let effect = ActionEffect {
            effect: Effect::Allow,
            policy: "resource.leave_request.v20210210".to_string(),
            scope: String::new(),
        };
        let json = serde_json::to_value(&effect).unwrap();
        assert!(json.get("scope").is_none());
        assert_eq!(json["effect"], "EFFECT_ALLOW");
    }

    #[test]
    fn trace_events_tag_their_kind() {
        let event = TraceEvent::RuleMatched {
            policy: "resource.leave_request.v20210210".to_string(),
            rule: "rule-002".to_string(),
            action: "approve".to_string(),
            effect: Effect::Allow,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "ruleMatched");
    }
}
