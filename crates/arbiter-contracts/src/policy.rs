//! The policy AST: the in-memory form of parsed policy documents.
//!
//! One source unit (a YAML or JSON file) decodes into exactly one
//! `PolicyDocument` holding exactly one of the four policy bodies. The AST
//! is immutable after load; the compiler reads it and produces the
//! evaluable form, never mutating it.
//!
//! Field names and string patterns mirror the source format, so every
//! struct carries `rename_all = "camelCase"` and rejects unknown fields —
//! an unrecognised key in a policy file is a load error, not a silent drop.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The required `apiVersion` value for every policy document.
pub const API_VERSION: &str = "api.cerbos.dev/v1";

/// Identifier reserved for decisions that matched no policy at all.
pub const NO_MATCH: &str = "NO_MATCH";

/// Names bound by the engine during condition evaluation. User variables
/// must not shadow them.
pub const RESERVED_VARIABLE_NAMES: &[&str] = &["request", "R", "P", "variables"];

/// A single parsed policy source unit.
///
/// Exactly one of the four body fields must be present; the validator
/// enforces this (the `Match` sum type below is enforced by construction,
/// but the top-level body is a plain record so that `apiVersion` and the
/// `jsonSchema` annotation can sit beside it).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyDocument {
    /// Must equal [`API_VERSION`].
    pub api_version: String,

    /// Optional editor-support annotation. Excluded from the content hash
    /// so YAML and JSON serializations of the same logical policy hash
    /// identically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<ResourcePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_policy: Option<PrincipalPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_roles: Option<DerivedRoles>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_variables: Option<ExportVariables>,
}

impl PolicyDocument {
    /// The identity of this document, used as the index key and rendered
    /// into audit-visible identifier strings.
    ///
    /// Returns `None` when no body field is present (the validator rejects
    /// such documents before they reach any consumer of identities).
    pub fn id(&self) -> Option<PolicyId> {
        if let Some(rp) = &self.resource_policy {
            return Some(PolicyId::Resource {
                kind: rp.resource.clone(),
                version: rp.version.clone(),
                scope: rp.scope.clone(),
            });
        }
        if let Some(pp) = &self.principal_policy {
            return Some(PolicyId::Principal {
                principal: pp.principal.clone(),
                version: pp.version.clone(),
                scope: pp.scope.clone(),
            });
        }
        if let Some(dr) = &self.derived_roles {
            return Some(PolicyId::DerivedRoles {
                name: dr.name.clone(),
            });
        }
        if let Some(ev) = &self.export_variables {
            return Some(PolicyId::ExportVariables {
                name: ev.name.clone(),
            });
        }
        None
    }
}

/// Rules governing actions on a resource kind, per version and scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourcePolicy {
    /// The resource kind this policy governs (matched against
    /// `CheckInput.resource.kind`).
    pub resource: String,

    /// Policy version label; must match `^[A-Za-z0-9_]+$`.
    pub version: String,

    /// Dotted scope namespace, empty for the root scope.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    /// Names of `DerivedRoles` sets whose definitions this policy's rules
    /// may reference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_derived_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,

    /// Optional attribute schemas enforced on matching requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<PolicySchemas>,

    /// Evaluated in declaration order; the first applicable rule wins.
    pub rules: Vec<ResourceRule>,
}

/// One rule in a resource policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceRule {
    /// Optional identifier; empty names are allowed and ignored.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Action globs; non-empty, unique within the rule.
    pub actions: Vec<String>,

    /// Base roles this rule applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,

    /// Derived-role names this rule applies to; each must resolve through
    /// the policy's `importDerivedRoles`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_roles: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    pub effect: Effect,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

/// Rules targeting one principal directly, overriding resource policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PrincipalPolicy {
    /// The principal id this policy targets.
    pub principal: String,

    /// Policy version label; must match `^[A-Za-z0-9_]+$`.
    pub version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,

    pub rules: Vec<PrincipalRule>,
}

/// Per-resource-kind action rules within a principal policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PrincipalRule {
    /// Resource-kind glob matched against the request's resource kind.
    pub resource: String,

    /// Evaluated in declaration order; the first matching action wins.
    pub actions: Vec<PrincipalAction>,
}

/// One action entry in a principal rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PrincipalAction {
    /// Action literal or glob matched against the requested action.
    pub action: String,

    pub effect: Effect,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,
}

/// A named set of derived-role definitions, importable by resource policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DerivedRoles {
    pub name: String,

    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,

    pub definitions: Vec<RoleDef>,
}

/// One derived-role definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoleDef {
    /// The derived-role name activated when this definition fires.
    pub name: String,

    /// Base roles the principal must hold (at least one) for the definition
    /// to be considered.
    pub parent_roles: Vec<String>,

    /// Optional activation condition, evaluated against the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

/// A named bundle of reusable condition variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExportVariables {
    pub name: String,

    /// Variable name to expression source.
    pub definitions: BTreeMap<String, String>,
}

/// The variable block shared by resource, principal, and derived-role
/// policies.
///
/// The effective set is the union of every imported bundle and the local
/// map; a local name shadows an imported one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Variables {
    /// Names of `ExportVariables` bundles to import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import: Vec<String>,

    /// Locally defined variables, name to expression source.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local: BTreeMap<String, String>,
}

impl Variables {
    pub fn is_empty(&self) -> bool {
        self.import.is_empty() && self.local.is_empty()
    }
}

/// Attribute schemas declared by a resource policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicySchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_schema: Option<SchemaRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_schema: Option<SchemaRef>,
}

/// A reference into the schema registry, e.g. `cerbos:///leave_request.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaRef {
    #[serde(rename = "ref")]
    pub reference: String,
}

/// A condition attached to a rule or derived-role definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Condition {
    #[serde(rename = "match")]
    pub match_: Match,
}

/// The condition tree: a sum type with exactly one active variant.
///
/// Serde's externally-tagged enum representation enforces exactly-one-of at
/// decode time; a document with both `all` and `expr` keys fails to parse
/// rather than silently preferring one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Match {
    /// Logical AND; short-circuits on the first false child.
    All(Vec<Match>),
    /// Logical OR; short-circuits on the first true child.
    Any(Vec<Match>),
    /// Logical NOT-OR; short-circuits to false on the first true child.
    None(Vec<Match>),
    /// A single expression that must evaluate to a boolean.
    Expr(String),
}

/// An output expression attached to a rule, evaluated after the effect is
/// decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Output {
    pub expr: String,
}

/// The outcome a rule produces for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    #[serde(rename = "EFFECT_ALLOW")]
    Allow,
    #[serde(rename = "EFFECT_DENY")]
    Deny,
}

/// Policy identity: `(kind, name-or-target, version, scope)`.
///
/// `Display` renders the stable, audit-visible identifier strings:
///
/// - `resource.<kind>.v<version>` with optional `/<scope>`
/// - `principal.<id>.v<version>` with optional `/<scope>`
/// - `derived_roles.<name>`
/// - `export_variables.<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyId {
    Resource {
        kind: String,
        version: String,
        scope: String,
    },
    Principal {
        principal: String,
        version: String,
        scope: String,
    },
    DerivedRoles {
        name: String,
    },
    ExportVariables {
        name: String,
    },
}

impl PolicyId {
    /// The scope component, empty for scope-less policy kinds.
    pub fn scope(&self) -> &str {
        match self {
            PolicyId::Resource { scope, .. } | PolicyId::Principal { scope, .. } => scope,
            _ => "",
        }
    }

    /// A copy of this identity with the scope replaced.
    ///
    /// Used when walking the scope chain: `resource.kind.vX/a.b` at scope
    /// `a` becomes `resource.kind.vX/a`.
    pub fn at_scope(&self, scope: &str) -> PolicyId {
        match self {
            PolicyId::Resource { kind, version, .. } => PolicyId::Resource {
                kind: kind.clone(),
                version: version.clone(),
                scope: scope.to_string(),
            },
            PolicyId::Principal { principal, version, .. } => PolicyId::Principal {
                principal: principal.clone(),
                version: version.clone(),
                scope: scope.to_string(),
            },
            other => other.clone(),
        }
    }
}

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyId::Resource { kind, version, scope } => {
                write!(f, "resource.{kind}.v{version}")?;
                if !scope.is_empty() {
                    write!(f, "/{scope}")?;
                }
                Ok(())
            }
            PolicyId::Principal { principal, version, scope } => {
                write!(f, "principal.{principal}.v{version}")?;
                if !scope.is_empty() {
                    write!(f, "/{scope}")?;
                }
                Ok(())
            }
            PolicyId::DerivedRoles { name } => write!(f, "derived_roles.{name}"),
            PolicyId::ExportVariables { name } => write!(f, "export_variables.{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_id_renders_identifier_strings() {
        let id = PolicyId::Resource {
            kind: "leave_request".to_string(),
            version: "20210210".to_string(),
            scope: String::new(),
        };
        assert_eq!(id.to_string(), "resource.leave_request.v20210210");

        let scoped = id.at_scope("acme.hr");
        assert_eq!(scoped.to_string(), "resource.leave_request.v20210210/acme.hr");

        let principal = PolicyId::Principal {
            principal: "donald_duck".to_string(),
            version: "20210210".to_string(),
            scope: String::new(),
        };
        assert_eq!(principal.to_string(), "principal.donald_duck.v20210210");

        let dr = PolicyId::DerivedRoles { name: "beta".to_string() };
        assert_eq!(dr.to_string(), "derived_roles.beta");

        let ev = PolicyId::ExportVariables { name: "common".to_string() };
        assert_eq!(ev.to_string(), "export_variables.common");
    }

    #[test]
    fn match_decodes_exactly_one_variant() {
        let m: Match = serde_json::from_value(serde_json::json!({
            "all": [
                { "expr": "R.attr.status == \"PENDING_APPROVAL\"" },
                { "expr": "P.attr.geography == R.attr.geography" }
            ]
        }))
        .unwrap();
        match m {
            Match::All(children) => assert_eq!(children.len(), 2),
            other => panic!("expected All, got {other:?}"),
        }

        // Two keys at once is not a valid sum value.
        let err = serde_json::from_value::<Match>(serde_json::json!({
            "any": [{ "expr": "true" }],
            "expr": "true"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn effect_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&Effect::Allow).unwrap(),
            "\"EFFECT_ALLOW\""
        );
        let e: Effect = serde_json::from_str("\"EFFECT_DENY\"").unwrap();
        assert_eq!(e, Effect::Deny);
    }

    #[test]
    fn document_id_reflects_the_active_body() {
        let doc: PolicyDocument = serde_json::from_value(serde_json::json!({
            "apiVersion": "api.cerbos.dev/v1",
            "derivedRoles": {
                "name": "beta",
                "definitions": [
                    { "name": "any_employee", "parentRoles": ["employee"] }
                ]
            }
        }))
        .unwrap();
        assert_eq!(
            doc.id(),
            Some(PolicyId::DerivedRoles { name: "beta".to_string() })
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_value::<PolicyDocument>(serde_json::json!({
            "apiVersion": "api.cerbos.dev/v1",
            "resourcePolicy": {
                "resource": "leave_request",
                "version": "default",
                "rules": [],
                "surpriseField": true
            }
        }));
        assert!(err.is_err());
    }
}
