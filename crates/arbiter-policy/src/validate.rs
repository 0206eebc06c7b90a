//! Structural validation of decoded policy documents.
//!
//! Validation runs after decoding and before hashing/admission. All
//! failures for a document are collected before returning so authors see
//! the complete set in one pass; every failure carries the field path of
//! the offending value.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use arbiter_contracts::error::{ArbiterError, ArbiterResult, ValidationFailure};
use arbiter_contracts::policy::{
    Condition, DerivedRoles, ExportVariables, Match, PolicyDocument, PolicySchemas,
    PrincipalPolicy, ResourcePolicy, Variables, API_VERSION, RESERVED_VARIABLE_NAMES,
};

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

static SCOPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_]*)(\.[-A-Za-z0-9_]*)*$").unwrap());

// The source pattern for rule names, preserved verbatim. The character
// class spans '-' through '.', which also admits the empty string via the
// outer '*' — empty names are legal and ignored for identification.
static RULE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\--\.0-9@-Z_a-z]*$").unwrap());

/// Validate one decoded document. Returns `ArbiterError::Validation` with
/// every collected failure, or `Ok` when the document is structurally sound.
pub fn validate_document(document: &PolicyDocument) -> ArbiterResult<()> {
    let mut v = Validator::default();

    if document.api_version != API_VERSION {
        v.fail(
            "apiVersion",
            format!("must be \"{API_VERSION}\", found \"{}\"", document.api_version),
        );
    }

    let bodies = [
        document.resource_policy.is_some(),
        document.principal_policy.is_some(),
        document.derived_roles.is_some(),
        document.export_variables.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    if bodies != 1 {
        v.fail(
            "",
            format!(
                "exactly one of resourcePolicy, principalPolicy, derivedRoles, \
                 exportVariables must be set, found {bodies}"
            ),
        );
    }

    if let Some(rp) = &document.resource_policy {
        v.resource_policy(rp);
    }
    if let Some(pp) = &document.principal_policy {
        v.principal_policy(pp);
    }
    if let Some(dr) = &document.derived_roles {
        v.derived_roles(dr);
    }
    if let Some(ev) = &document.export_variables {
        v.export_variables(ev);
    }

    v.finish()
}

#[derive(Default)]
struct Validator {
    failures: Vec<ValidationFailure>,
}

impl Validator {
    fn fail(&mut self, path: &str, message: impl Into<String>) {
        self.failures.push(ValidationFailure {
            path: path.to_string(),
            message: message.into(),
        });
    }

    fn finish(self) -> ArbiterResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ArbiterError::Validation { failures: self.failures })
        }
    }

    fn version(&mut self, path: &str, version: &str) {
        if !VERSION_RE.is_match(version) {
            self.fail(path, format!("\"{version}\" must match ^[A-Za-z0-9_]+$"));
        }
    }

    fn scope(&mut self, path: &str, scope: &str) {
        if !scope.is_empty() && !SCOPE_RE.is_match(scope) {
            self.fail(path, format!("\"{scope}\" is not a valid scope"));
        }
    }

    fn rule_name(&mut self, path: &str, name: &str) {
        if !RULE_NAME_RE.is_match(name) {
            self.fail(path, format!("\"{name}\" is not a valid rule name"));
        }
    }

    fn required(&mut self, path: &str, value: &str) {
        if value.is_empty() {
            self.fail(path, "must not be empty");
        }
    }

    fn resource_policy(&mut self, rp: &ResourcePolicy) {
        let base = "resourcePolicy";
        self.required(&format!("{base}.resource"), &rp.resource);
        self.version(&format!("{base}.version"), &rp.version);
        self.scope(&format!("{base}.scope"), &rp.scope);
        for (i, import) in rp.import_derived_roles.iter().enumerate() {
            self.required(&format!("{base}.importDerivedRoles[{i}]"), import);
        }
        self.variables(&format!("{base}.variables"), &rp.variables);
        if let Some(schemas) = &rp.schemas {
            self.schemas(&format!("{base}.schemas"), schemas);
        }

        let mut seen_names: HashSet<&str> = HashSet::new();
        for (i, rule) in rp.rules.iter().enumerate() {
            let path = format!("{base}.rules[{i}]");

            self.rule_name(&format!("{path}.name"), &rule.name);
            if !rule.name.is_empty() && !seen_names.insert(rule.name.as_str()) {
                self.fail(&format!("{path}.name"), format!("duplicate rule name \"{}\"", rule.name));
            }

            if rule.actions.is_empty() {
                self.fail(&format!("{path}.actions"), "must not be empty");
            }
            let mut seen_actions: HashSet<&str> = HashSet::new();
            for (j, action) in rule.actions.iter().enumerate() {
                self.required(&format!("{path}.actions[{j}]"), action);
                if !seen_actions.insert(action.as_str()) {
                    self.fail(
                        &format!("{path}.actions[{j}]"),
                        format!("duplicate action \"{action}\""),
                    );
                }
            }

            if rule.roles.is_empty() && rule.derived_roles.is_empty() {
                self.fail(&path, "at least one of roles or derivedRoles must be non-empty");
            }
            for (j, role) in rule.roles.iter().enumerate() {
                self.required(&format!("{path}.roles[{j}]"), role);
            }
            for (j, role) in rule.derived_roles.iter().enumerate() {
                self.required(&format!("{path}.derivedRoles[{j}]"), role);
            }

            if let Some(condition) = &rule.condition {
                self.condition(&format!("{path}.condition"), condition);
            }
            if let Some(output) = &rule.output {
                self.required(&format!("{path}.output.expr"), &output.expr);
            }
        }
    }

    fn principal_policy(&mut self, pp: &PrincipalPolicy) {
        let base = "principalPolicy";
        self.required(&format!("{base}.principal"), &pp.principal);
        self.version(&format!("{base}.version"), &pp.version);
        self.scope(&format!("{base}.scope"), &pp.scope);
        self.variables(&format!("{base}.variables"), &pp.variables);

        for (i, rule) in pp.rules.iter().enumerate() {
            let path = format!("{base}.rules[{i}]");
            self.required(&format!("{path}.resource"), &rule.resource);
            if rule.actions.is_empty() {
                self.fail(&format!("{path}.actions"), "must not be empty");
            }
            for (j, entry) in rule.actions.iter().enumerate() {
                let entry_path = format!("{path}.actions[{j}]");
                self.required(&format!("{entry_path}.action"), &entry.action);
                self.rule_name(&format!("{entry_path}.name"), &entry.name);
                if let Some(condition) = &entry.condition {
                    self.condition(&format!("{entry_path}.condition"), condition);
                }
                if let Some(output) = &entry.output {
                    self.required(&format!("{entry_path}.output.expr"), &output.expr);
                }
            }
        }
    }

    fn derived_roles(&mut self, dr: &DerivedRoles) {
        let base = "derivedRoles";
        self.required(&format!("{base}.name"), &dr.name);
        self.variables(&format!("{base}.variables"), &dr.variables);

        if dr.definitions.is_empty() {
            self.fail(&format!("{base}.definitions"), "must not be empty");
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, def) in dr.definitions.iter().enumerate() {
            let path = format!("{base}.definitions[{i}]");
            self.required(&format!("{path}.name"), &def.name);
            if !def.name.is_empty() && !seen.insert(def.name.as_str()) {
                self.fail(
                    &format!("{path}.name"),
                    format!("duplicate derived role \"{}\"", def.name),
                );
            }
            if def.parent_roles.is_empty() {
                self.fail(&format!("{path}.parentRoles"), "must not be empty");
            }
            for (j, parent) in def.parent_roles.iter().enumerate() {
                self.required(&format!("{path}.parentRoles[{j}]"), parent);
            }
            if let Some(condition) = &def.condition {
                self.condition(&format!("{path}.condition"), condition);
            }
        }
    }

    fn export_variables(&mut self, ev: &ExportVariables) {
        let base = "exportVariables";
        self.required(&format!("{base}.name"), &ev.name);
        for (name, expr) in &ev.definitions {
            let path = format!("{base}.definitions.{name}");
            if RESERVED_VARIABLE_NAMES.contains(&name.as_str()) {
                self.fail(&path, format!("\"{name}\" is a reserved name"));
            }
            if name.is_empty() {
                self.fail(&path, "variable name must not be empty");
            }
            if expr.is_empty() {
                self.fail(&path, "expression must not be empty");
            }
        }
    }

    fn variables(&mut self, path: &str, variables: &Variables) {
        for (i, import) in variables.import.iter().enumerate() {
            self.required(&format!("{path}.import[{i}]"), import);
        }
        for (name, expr) in &variables.local {
            let entry_path = format!("{path}.local.{name}");
            if RESERVED_VARIABLE_NAMES.contains(&name.as_str()) {
                self.fail(&entry_path, format!("\"{name}\" is a reserved name"));
            }
            if name.is_empty() {
                self.fail(&entry_path, "variable name must not be empty");
            }
            if expr.is_empty() {
                self.fail(&entry_path, "expression must not be empty");
            }
        }
    }

    fn schemas(&mut self, path: &str, schemas: &PolicySchemas) {
        if let Some(principal) = &schemas.principal_schema {
            self.required(&format!("{path}.principalSchema.ref"), &principal.reference);
        }
        if let Some(resource) = &schemas.resource_schema {
            self.required(&format!("{path}.resourceSchema.ref"), &resource.reference);
        }
    }

    fn condition(&mut self, path: &str, condition: &Condition) {
        self.match_node(&format!("{path}.match"), &condition.match_);
    }

    fn match_node(&mut self, path: &str, node: &Match) {
        match node {
            Match::All(children) => self.match_children(path, "all", children),
            Match::Any(children) => self.match_children(path, "any", children),
            Match::None(children) => self.match_children(path, "none", children),
            Match::Expr(expr) => {
                if expr.is_empty() {
                    self.fail(&format!("{path}.expr"), "must not be empty");
                }
            }
        }
    }

    fn match_children(&mut self, path: &str, label: &str, children: &[Match]) {
        if children.is_empty() {
            self.fail(&format!("{path}.{label}"), "must contain at least one operand");
        }
        for (i, child) in children.iter().enumerate() {
            self.match_node(&format!("{path}.{label}[{i}]"), child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(doc: serde_json::Value) -> PolicyDocument {
        serde_json::from_value(doc).unwrap()
    }

    fn failures(doc: serde_json::Value) -> Vec<ValidationFailure> {
        match validate_document(&decode(doc)) {
            Ok(()) => Vec::new(),
            Err(ArbiterError::Validation { failures }) => failures,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    fn minimal_resource_policy() -> serde_json::Value {
        json!({
            "apiVersion": "api.cerbos.dev/v1",
            "resourcePolicy": {
                "resource": "leave_request",
                "version": "default",
                "rules": [
                    { "actions": ["view"], "roles": ["employee"], "effect": "EFFECT_ALLOW" }
                ]
            }
        })
    }

    #[test]
    fn minimal_policy_is_valid() {
        assert!(failures(minimal_resource_policy()).is_empty());
    }

    #[test]
    fn bad_version_is_reported_with_its_path() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["version"] = json!("has spaces");
        let fs = failures(doc);
        assert_eq!(fs.len(), 1);
        assert_eq!(fs[0].path, "resourcePolicy.version");
    }

    #[test]
    fn scope_pattern_is_enforced() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["scope"] = json!(".starts.with.dot");
        assert_eq!(failures(doc)[0].path, "resourcePolicy.scope");

        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["scope"] = json!("acme.hr.uk");
        assert!(failures(doc).is_empty());
    }

    #[test]
    fn rule_without_any_role_source_is_rejected() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["rules"][0] = json!({
            "actions": ["view"], "effect": "EFFECT_ALLOW"
        });
        let fs = failures(doc);
        assert!(fs.iter().any(|f| f.message.contains("roles or derivedRoles")));
    }

    #[test]
    fn duplicate_actions_are_rejected() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["rules"][0]["actions"] = json!(["view", "view"]);
        let fs = failures(doc);
        assert!(fs.iter().any(|f| f.message.contains("duplicate action")));
    }

    #[test]
    fn empty_rule_names_are_allowed_but_duplicates_are_not() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["rules"] = json!([
            { "actions": ["view"], "roles": ["a"], "effect": "EFFECT_ALLOW" },
            { "actions": ["edit"], "roles": ["a"], "effect": "EFFECT_ALLOW" },
            { "name": "r1", "actions": ["list"], "roles": ["a"], "effect": "EFFECT_ALLOW" },
            { "name": "r1", "actions": ["drop"], "roles": ["a"], "effect": "EFFECT_ALLOW" }
        ]);
        let fs = failures(doc);
        assert_eq!(fs.len(), 1);
        assert!(fs[0].message.contains("duplicate rule name"));
    }

    #[test]
    fn empty_match_operands_are_rejected() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["rules"][0]["condition"] = json!({ "match": { "all": [] } });
        let fs = failures(doc);
        assert_eq!(fs[0].path, "resourcePolicy.rules[0].condition.match.all");
    }

    #[test]
    fn reserved_variable_names_are_rejected() {
        let mut doc = minimal_resource_policy();
        doc["resourcePolicy"]["variables"] = json!({ "local": { "request": "1 == 1" } });
        let fs = failures(doc);
        assert!(fs.iter().any(|f| f.message.contains("reserved")));
    }

    #[test]
    fn derived_roles_need_parent_roles() {
        let doc = json!({
            "apiVersion": "api.cerbos.dev/v1",
            "derivedRoles": {
                "name": "beta",
                "definitions": [ { "name": "any_employee", "parentRoles": [] } ]
            }
        });
        let fs = failures(doc);
        assert_eq!(fs[0].path, "derivedRoles.definitions[0].parentRoles");
    }

    #[test]
    fn two_bodies_are_rejected() {
        let doc = json!({
            "apiVersion": "api.cerbos.dev/v1",
            "derivedRoles": { "name": "beta", "definitions": [ { "name": "x", "parentRoles": ["y"] } ] },
            "exportVariables": { "name": "common", "definitions": {} }
        });
        let fs = failures(doc);
        assert!(fs.iter().any(|f| f.message.contains("exactly one of")));
    }

    #[test]
    fn wrong_api_version_is_rejected() {
        let mut doc = minimal_resource_policy();
        doc["apiVersion"] = json!("api.cerbos.dev/v2");
        let fs = failures(doc);
        assert_eq!(fs[0].path, "apiVersion");
    }
}
