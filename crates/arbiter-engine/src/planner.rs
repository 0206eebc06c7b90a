//! The query planner: check semantics without a resource instance.
//!
//! Given a principal, a resource kind, and one action, the planner walks
//! the same policy chain as the engine but partially evaluates conditions:
//! everything known at plan time (principal, aux data, variables that do
//! not touch the resource) folds away; references to per-instance resource
//! attributes stay symbolic.
//!
//! The result is the filter a caller can push into a query layer:
//! `ALWAYS_ALLOWED`, `ALWAYS_DENIED`, or a residual expression over `R`
//! that decides the effect for any concrete resource.
//!
//! First-match semantics are encoded structurally: each allow rule
//! contributes its condition guarded by the negations of every deny rule
//! that precedes it in the walk order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use arbiter_contracts::error::ArbiterResult;
use arbiter_contracts::policy::Effect;
use arbiter_contracts::request::{AuxData, Principal};
use arbiter_contracts::value::Value;
use arbiter_expr::{
    partial_eval, simplify, BinOp, Expr, Partial, PartialEnvironment, UnaryOp,
};

use crate::compile::{CompiledMatch, VariableTable};
use crate::engine::Engine;

/// A plan query: like a check, but the resource has no instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanInput {
    pub request_id: String,
    pub principal: Principal,
    pub resource: PlanResource,
    pub action: String,
    #[serde(default)]
    pub aux_data: Option<AuxData>,
}

/// The resource side of a plan query: kind, version, and scope only.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlanResource {
    pub kind: String,
    #[serde(default)]
    pub policy_version: Option<String>,
    #[serde(default)]
    pub scope: String,
}

/// The planner's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanFilter {
    /// Every instance of the kind is allowed for this principal and action.
    AlwaysAllowed,
    /// No instance can be allowed.
    AlwaysDenied,
    /// Allowed iff the residual evaluates to true against the instance.
    Conditional(Expr),
}

impl std::fmt::Display for PlanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanFilter::AlwaysAllowed => write!(f, "ALWAYS_ALLOWED"),
            PlanFilter::AlwaysDenied => write!(f, "ALWAYS_DENIED"),
            PlanFilter::Conditional(expr) => write!(f, "{expr}"),
        }
    }
}

/// The planner's answer for one `(principal, action, kind)` query.
#[derive(Debug, Clone)]
pub struct PlanOutput {
    pub request_id: String,
    pub action: String,
    pub kind: String,
    pub filter: PlanFilter,
}

/// One rule surviving role/action filtering, with its partially evaluated
/// condition.
struct Candidate {
    condition: Expr,
    effect: Effect,
}

impl Engine {
    /// Produce the residual filter for `input`.
    pub fn plan(&self, input: &PlanInput) -> ArbiterResult<PlanOutput> {
        let snapshot = self.store().snapshot();
        let now = Utc::now();

        let principal_version = input
            .principal
            .policy_version
            .clone()
            .unwrap_or_else(|| self.config().default_policy_version.clone());
        let resource_version = input
            .resource
            .policy_version
            .clone()
            .unwrap_or_else(|| self.config().default_policy_version.clone());

        let principal_chain = snapshot.principal_chain(
            &input.principal.id,
            &principal_version,
            &input.principal.scope,
        );
        let resource_chain = snapshot.resource_chain(
            &input.resource.kind,
            &resource_version,
            &input.resource.scope,
        );

        let bindings = PlanBindings::new(&input.principal, input.aux_data.as_ref(), now);
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut terminal = false;

        // ── Principal policies first, as in check ────────────────────────
        for (_, pp) in &principal_chain {
            if terminal {
                break;
            }
            let env = PlanEnv { bindings: &bindings, table: &pp.variables };
            for rule in &pp.rules {
                if terminal {
                    break;
                }
                if !rule.resource.matches(&input.resource.kind) {
                    continue;
                }
                for entry in &rule.actions {
                    if !entry.action.matches(&input.action) {
                        continue;
                    }
                    if let Some(candidate) =
                        candidate_from(entry.condition.as_ref(), Expr::Lit(Value::Bool(true)), entry.effect, &env)
                    {
                        terminal = matches!(candidate.condition, Expr::Lit(Value::Bool(true)));
                        candidates.push(candidate);
                        if terminal {
                            break;
                        }
                    }
                }
            }
        }

        // ── Resource policies, accumulating derived-role gates ───────────
        let mut derived_gates: HashMap<String, Expr> = HashMap::new();
        for (_, rp) in &resource_chain {
            if terminal {
                break;
            }

            // Activation gates for this scope's derived roles, merged into
            // the accumulated set (an OR across scopes mirrors the engine's
            // accumulated effective set).
            for dr in &rp.derived_roles {
                if !dr
                    .parent_roles
                    .iter()
                    .any(|r| input.principal.roles.contains(r))
                {
                    continue;
                }
                let env = PlanEnv { bindings: &bindings, table: &dr.variables };
                let gate = match dr.condition.as_ref() {
                    None => Expr::Lit(Value::Bool(true)),
                    Some(condition) => match partial_match(condition, &env) {
                        Ok(expr) => expr,
                        // An activation that errors at plan time cannot
                        // activate, matching the engine's trap-and-skip.
                        Err(_) => Expr::Lit(Value::Bool(false)),
                    },
                };
                derived_gates
                    .entry(dr.name.clone())
                    .and_modify(|existing| {
                        *existing = or(existing.clone(), gate.clone());
                    })
                    .or_insert(gate);
            }

            let env = PlanEnv { bindings: &bindings, table: &rp.variables };
            for rule in &rp.rules {
                if !rule.actions.matches(&input.action) {
                    continue;
                }

                // Role gate: base roles fold to a constant; derived roles
                // contribute their activation residuals.
                let mut gate = if rule.roles.contains("*")
                    || rule.roles.iter().any(|r| input.principal.roles.contains(r))
                {
                    Expr::Lit(Value::Bool(true))
                } else {
                    Expr::Lit(Value::Bool(false))
                };
                if !matches!(gate, Expr::Lit(Value::Bool(true))) {
                    for role in &rule.derived_roles {
                        if let Some(activation) = derived_gates.get(role) {
                            gate = or(gate, activation.clone());
                        }
                    }
                }
                let gate = simplify(gate);
                if matches!(gate, Expr::Lit(Value::Bool(false))) {
                    continue;
                }

                if let Some(candidate) =
                    candidate_from(rule.condition.as_ref(), gate, rule.effect, &env)
                {
                    terminal = matches!(candidate.condition, Expr::Lit(Value::Bool(true)));
                    candidates.push(candidate);
                    if terminal {
                        break;
                    }
                }
            }
        }

        let filter = fold_candidates(candidates);
        debug!(
            request_id = %input.request_id,
            action = %input.action,
            kind = %input.resource.kind,
            filter = %filter,
            "plan computed"
        );

        Ok(PlanOutput {
            request_id: input.request_id.clone(),
            action: input.action.clone(),
            kind: input.resource.kind.clone(),
            filter,
        })
    }
}

/// Partially evaluate a rule into a candidate. Returns `None` when the rule
/// can never match (condition folded to false or errored).
fn candidate_from(
    condition: Option<&CompiledMatch>,
    gate: Expr,
    effect: Effect,
    env: &PlanEnv<'_>,
) -> Option<Candidate> {
    let cond = match condition {
        None => Expr::Lit(Value::Bool(true)),
        Some(node) => match partial_match(node, env) {
            Ok(expr) => expr,
            // Erroring conditions are treated as non-matching, as in check.
            Err(_) => return None,
        },
    };
    let combined = simplify(and(gate, cond));
    if matches!(combined, Expr::Lit(Value::Bool(false))) {
        return None;
    }
    Some(Candidate { condition: combined, effect })
}

/// Partially evaluate a match tree into a residual boolean expression.
fn partial_match(node: &CompiledMatch, env: &PlanEnv<'_>) -> ArbiterResult<Expr> {
    Ok(match node {
        CompiledMatch::All(children) => {
            let mut acc = Expr::Lit(Value::Bool(true));
            for child in children {
                acc = and(acc, partial_match(child, env)?);
            }
            simplify(acc)
        }
        CompiledMatch::Any(children) => {
            let mut acc = Expr::Lit(Value::Bool(false));
            for child in children {
                acc = or(acc, partial_match(child, env)?);
            }
            simplify(acc)
        }
        CompiledMatch::None(children) => {
            let mut acc = Expr::Lit(Value::Bool(false));
            for child in children {
                acc = or(acc, partial_match(child, env)?);
            }
            simplify(Expr::Unary(UnaryOp::Not, Box::new(simplify(acc))))
        }
        CompiledMatch::Expr(program) => {
            match partial_eval(&program.ast, env)? {
                Partial::Known(value) => Expr::Lit(value),
                Partial::Residual(expr) => expr,
            }
        }
    })
}

/// Fold ordered candidates into the allow filter: each allow condition is
/// guarded by the negation of every preceding deny condition.
fn fold_candidates(candidates: Vec<Candidate>) -> PlanFilter {
    let mut allow = Expr::Lit(Value::Bool(false));
    let mut deny_guard = Expr::Lit(Value::Bool(true));

    for candidate in candidates {
        match candidate.effect {
            Effect::Allow => {
                allow = or(allow, and(deny_guard.clone(), candidate.condition));
            }
            Effect::Deny => {
                deny_guard = and(
                    deny_guard,
                    Expr::Unary(UnaryOp::Not, Box::new(candidate.condition)),
                );
            }
        }
    }

    match simplify(allow) {
        Expr::Lit(Value::Bool(true)) => PlanFilter::AlwaysAllowed,
        Expr::Lit(Value::Bool(false)) => PlanFilter::AlwaysDenied,
        residual => PlanFilter::Conditional(residual),
    }
}

fn and(left: Expr, right: Expr) -> Expr {
    Expr::Binary(BinOp::And, Box::new(left), Box::new(right))
}

fn or(left: Expr, right: Expr) -> Expr {
    Expr::Binary(BinOp::Or, Box::new(left), Box::new(right))
}

/// Known bindings at plan time: the principal and aux data documents.
struct PlanBindings {
    principal: Value,
    aux: Value,
    now: DateTime<Utc>,
}

impl PlanBindings {
    fn new(principal: &Principal, aux_data: Option<&AuxData>, now: DateTime<Utc>) -> Self {
        let mut p = std::collections::BTreeMap::new();
        p.insert("id".to_string(), Value::String(principal.id.clone()));
        p.insert(
            "roles".to_string(),
            Value::List(principal.roles.iter().map(|r| Value::String(r.clone())).collect()),
        );
        p.insert(
            "attr".to_string(),
            Value::Map(
                principal
                    .attr
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        );

        let mut aux = std::collections::BTreeMap::new();
        aux.insert(
            "jwt".to_string(),
            Value::Map(
                aux_data
                    .map(|a| {
                        a.jwt
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from_json(v)))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
        );

        Self {
            principal: Value::Map(p),
            aux: Value::Map(aux),
            now,
        }
    }
}

/// The planner's partial-evaluation environment for one variable table.
struct PlanEnv<'a> {
    bindings: &'a PlanBindings,
    table: &'a VariableTable,
}

impl PartialEnvironment for PlanEnv<'_> {
    fn lookup(&self, name: &str) -> Option<Partial> {
        match name {
            "P" | "request.principal" => Some(Partial::Known(self.bindings.principal.clone())),
            "request.auxData" => Some(Partial::Known(self.bindings.aux.clone())),
            // The resource is the unknown: keep it symbolic under its
            // canonical alias.
            "R" | "request.resource" => {
                Some(Partial::Residual(Expr::Ident("R".to_string())))
            }
            "request" => Some(Partial::Residual(Expr::Ident("request".to_string()))),
            _ => None,
        }
    }

    fn variable_ast(&self, name: &str) -> Option<Expr> {
        self.table.ast(name).cloned()
    }

    fn now(&self) -> DateTime<Utc> {
        self.bindings.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::engine::Engine;
    use crate::fixtures;
    use crate::index::Store;
    use arbiter_contracts::config::EngineConfig;
    use arbiter_contracts::request::CheckInput;
    use arbiter_expr::{compile_ast, evaluate_bool, CompileContext, Environment};
    use arbiter_schema::SchemaRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn engine_with(policies: Vec<arbiter_policy::Policy>) -> Engine {
        let store = Arc::new(Store::new());
        store.publish(compile(&policies).unwrap());
        Engine::new(store, Arc::new(SchemaRegistry::new()), EngineConfig::default())
    }

    fn plan_input(principal: serde_json::Value, action: &str, version: &str) -> PlanInput {
        serde_json::from_value(json!({
            "requestId": "plan-001",
            "principal": principal,
            "resource": { "kind": "leave_request", "policyVersion": version },
            "action": action
        }))
        .unwrap()
    }

    fn sally() -> serde_json::Value {
        json!({
            "id": "sally",
            "policyVersion": "20210210",
            "roles": ["employee", "manager"],
            "attr": { "geography": "GB", "managed_geographies": "GB" }
        })
    }

    /// Bind `R` to a concrete resource and evaluate a residual.
    struct ResidualEnv {
        resource: Value,
    }

    impl Environment for ResidualEnv {
        fn lookup(&self, name: &str) -> Option<Value> {
            match name {
                "R" => Some(self.resource.clone()),
                _ => None,
            }
        }

        fn variable(&self, _slot: usize) -> ArbiterResult<Value> {
            unreachable!("residuals have no variable slots")
        }

        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    fn eval_residual(filter: &PlanFilter, resource_attr: serde_json::Value) -> bool {
        match filter {
            PlanFilter::AlwaysAllowed => true,
            PlanFilter::AlwaysDenied => false,
            PlanFilter::Conditional(expr) => {
                let ctx = CompileContext::empty("residual");
                let source = expr.to_string();
                let program = compile_ast(expr.clone(), &source, &ctx).unwrap();
                let env = ResidualEnv {
                    resource: Value::from_json(&json!({ "attr": resource_attr })),
                };
                evaluate_bool(&program, &env).unwrap()
            }
        }
    }

    #[test]
    fn admin_is_always_allowed() {
        let engine = engine_with(fixtures::leave_request_bundle());
        let input = plan_input(
            json!({ "id": "root", "roles": ["admin"], "attr": {} }),
            "approve",
            "20210210",
        );
        let output = engine.plan(&input).unwrap();
        assert_eq!(output.filter, PlanFilter::AlwaysAllowed);
    }

    #[test]
    fn stranger_is_always_denied() {
        let engine = engine_with(fixtures::leave_request_bundle());
        let input = plan_input(
            json!({ "id": "nobody", "roles": ["contractor"], "attr": {} }),
            "approve",
            "20210210",
        );
        let output = engine.plan(&input).unwrap();
        assert_eq!(output.filter, PlanFilter::AlwaysDenied);
    }

    #[test]
    fn manager_approve_yields_a_residual_over_the_resource() {
        let engine = engine_with(fixtures::leave_request_bundle());
        let output = engine
            .plan(&plan_input(sally(), "approve", "20210210"))
            .unwrap();

        let filter = &output.filter;
        assert!(matches!(filter, PlanFilter::Conditional(_)), "got {filter}");

        // Soundness against the check engine's scenario outcomes.
        assert!(eval_residual(
            filter,
            json!({ "geography": "GB", "status": "PENDING_APPROVAL", "owner": "john" })
        ));
        assert!(!eval_residual(
            filter,
            json!({ "geography": "GB", "status": "DRAFT", "owner": "john" })
        ));
        assert!(!eval_residual(
            filter,
            json!({ "geography": "FR", "status": "PENDING_APPROVAL", "owner": "john" })
        ));
    }

    #[test]
    fn plan_agrees_with_check_on_concrete_instances() {
        let engine = engine_with(fixtures::leave_request_bundle());
        let output = engine
            .plan(&plan_input(sally(), "approve", "20210210"))
            .unwrap();

        let samples = [
            json!({ "geography": "GB", "status": "PENDING_APPROVAL", "owner": "john" }),
            json!({ "geography": "GB", "status": "DRAFT", "owner": "john" }),
            json!({ "geography": "IE", "status": "PENDING_APPROVAL", "owner": "sally" }),
        ];

        for attr in samples {
            let planned = eval_residual(&output.filter, attr.clone());

            let check_input: CheckInput = serde_json::from_value(json!({
                "requestId": "plan-vs-check",
                "principal": sally(),
                "resource": {
                    "kind": "leave_request",
                    "id": "probe",
                    "policyVersion": "20210210",
                    "attr": attr
                },
                "actions": ["approve"]
            }))
            .unwrap();
            let checked = engine.check(&check_input).unwrap();
            let allowed = checked.actions["approve"].effect == Effect::Allow;

            assert_eq!(planned, allowed, "plan and check disagree for {attr:?}");
        }
    }

    #[test]
    fn deny_rules_guard_later_allows() {
        let engine = engine_with(fixtures::load_policies(&[r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  rules:
    - actions: ["view"]
      roles: [user]
      effect: EFFECT_DENY
      condition:
        match:
          expr: request.resource.attr.locked == true
    - actions: ["view"]
      roles: [user]
      effect: EFFECT_ALLOW
"#]));
        let input: PlanInput = serde_json::from_value(json!({
            "requestId": "plan-002",
            "principal": { "id": "u", "roles": ["user"], "attr": {} },
            "resource": { "kind": "doc" },
            "action": "view"
        }))
        .unwrap();

        let output = engine.plan(&input).unwrap();
        assert!(matches!(output.filter, PlanFilter::Conditional(_)));
        assert!(!eval_residual(&output.filter, json!({ "locked": true })));
        assert!(eval_residual(&output.filter, json!({ "locked": false })));
    }

    #[test]
    fn scoped_deny_terminates_the_plan_walk() {
        let engine = engine_with(fixtures::scoped_bundle());
        let input: PlanInput = serde_json::from_value(json!({
            "requestId": "plan-003",
            "principal": { "id": "harry", "roles": ["employee"], "attr": {} },
            "resource": { "kind": "leave_request", "scope": "acme.hr.uk" },
            "action": "delete"
        }))
        .unwrap();
        let output = engine.plan(&input).unwrap();
        assert_eq!(output.filter, PlanFilter::AlwaysDenied);

        let approve: PlanInput = serde_json::from_value(json!({
            "requestId": "plan-004",
            "principal": { "id": "harry", "roles": ["employee"], "attr": {} },
            "resource": { "kind": "leave_request", "scope": "acme.hr.uk" },
            "action": "approve"
        }))
        .unwrap();
        let output = engine.plan(&approve).unwrap();
        assert_eq!(output.filter, PlanFilter::AlwaysAllowed);
    }
}
