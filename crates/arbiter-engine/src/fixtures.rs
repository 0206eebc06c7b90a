//! Policy fixtures shared by the compile, index, engine, and planner tests.
//!
//! The bundle models a leave-request workflow: employees create and view
//! their requests, direct managers approve pending ones, and one principal
//! (`donald_duck`) carries a personal override policy.

use arbiter_policy::{load_policy, Policy, SourceFormat};

pub(crate) const DERIVED_ROLES_BETA: &str = r#"
apiVersion: api.cerbos.dev/v1
derivedRoles:
  name: beta
  definitions:
    - name: any_employee
      parentRoles: [employee]
    - name: employee_that_owns_the_record
      parentRoles: [employee]
      condition:
        match:
          expr: request.resource.attr.owner == request.principal.id
    - name: direct_manager
      parentRoles: [manager]
      condition:
        match:
          expr: request.resource.attr.geography == request.principal.attr.managed_geographies
"#;

pub(crate) const RESOURCE_POLICY_V20210210: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: "20210210"
  importDerivedRoles: [beta]
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles: [admin]
    - name: create-own
      actions: ["create"]
      effect: EFFECT_ALLOW
      derivedRoles: [any_employee]
    - actions: ["view:*"]
      effect: EFFECT_ALLOW
      derivedRoles: [employee_that_owns_the_record, direct_manager, any_employee]
    - name: approve-pending
      actions: ["approve"]
      effect: EFFECT_ALLOW
      derivedRoles: [direct_manager]
      condition:
        match:
          expr: request.resource.attr.status == "PENDING_APPROVAL"
      output:
        expr: '"approved_by:" + request.principal.id'
"#;

pub(crate) const RESOURCE_POLICY_STAGING: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: staging
  importDerivedRoles: [beta]
  rules:
    - actions: ["view:*"]
      effect: EFFECT_ALLOW
      derivedRoles: [any_employee]
    - actions: ["create"]
      effect: EFFECT_ALLOW
      derivedRoles: [any_employee]
"#;

pub(crate) const PRINCIPAL_POLICY_DONALD: &str = r#"
apiVersion: api.cerbos.dev/v1
principalPolicy:
  principal: donald_duck
  version: "20210210"
  rules:
    - resource: leave_request
      actions:
        - action: approve
          effect: EFFECT_ALLOW
          condition:
            match:
              expr: request.resource.attr.dev_record == true
        - action: "view:*"
          effect: EFFECT_ALLOW
"#;

/// Scoped family used by the scope-override tests: an explicit root deny
/// for `approve`, overridden by an allow at `acme`, plus a deny for
/// `delete` at the leaf.
pub(crate) const SCOPED_ROOT: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  rules:
    - actions: ["approve"]
      effect: EFFECT_DENY
      roles: [employee]
    - actions: ["view"]
      effect: EFFECT_ALLOW
      roles: [employee]
"#;

pub(crate) const SCOPED_ACME: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  scope: acme
  rules:
    - actions: ["approve"]
      effect: EFFECT_ALLOW
      roles: [employee]
"#;

pub(crate) const SCOPED_ACME_HR_UK: &str = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  scope: acme.hr.uk
  rules:
    - actions: ["delete"]
      effect: EFFECT_DENY
      roles: [employee]
"#;

pub(crate) fn load_policies(sources: &[&str]) -> Vec<Policy> {
    sources
        .iter()
        .map(|src| load_policy(src.as_bytes(), SourceFormat::Yaml).expect("fixture must load"))
        .collect()
}

/// The full leave-request bundle from the scenario tests.
pub(crate) fn leave_request_bundle() -> Vec<Policy> {
    load_policies(&[
        DERIVED_ROLES_BETA,
        RESOURCE_POLICY_V20210210,
        RESOURCE_POLICY_STAGING,
        PRINCIPAL_POLICY_DONALD,
    ])
}

/// The scoped family: root, `acme`, and `acme.hr.uk` (no `acme.hr`).
pub(crate) fn scoped_bundle() -> Vec<Policy> {
    load_policies(&[SCOPED_ROOT, SCOPED_ACME, SCOPED_ACME_HR_UK])
}
