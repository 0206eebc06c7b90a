//! The check engine: the per-request decision state machine.
//!
//! Resolution order for every action:
//!
//! 1. Principal policies, walking the principal's scope chain toward root.
//! 2. Resource policies, walking the resource's scope chain toward root,
//!    activating derived roles at each scope before testing rules.
//! 3. Deny by default: attributed to the most specific resource policy
//!    consulted, or `NO_MATCH` when no policy applied at all.
//!
//! Walking child scopes first encodes the override semantics: a DENY at a
//! scope ends the search, and a child's ALLOW stands even when a parent
//! would deny. Rule-level evaluation errors are trapped — the rule is
//! recorded as errored in the trace and treated as non-matching.
//!
//! The engine holds no per-request state; everything request-scoped lives
//! on the stack of `check`, so concurrent checks share nothing but the
//! immutable snapshot.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use arbiter_contracts::cancel::CancellationToken;
use arbiter_contracts::config::{EngineConfig, SchemaEnforcement};
use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::policy::{Effect, PolicySchemas, NO_MATCH};
use arbiter_contracts::request::{
    ActionEffect, AttrValidationError, CheckInput, CheckResult, OutputEntry, ResourceIdentifier,
    TraceEvent, ValidationSource,
};
use arbiter_contracts::value::Value;
use arbiter_expr::{evaluate, evaluate_bool, Environment};
use arbiter_schema::SchemaRegistry;

use crate::compile::{
    CompiledMatch, CompiledResourcePolicy, CompiledResourceRule, VariableTable,
};
use crate::index::Store;

/// The policy decision point.
///
/// One engine serves many concurrent requests; construct it once and share
/// it. Hot reloads go through the [`Store`], never through the engine.
pub struct Engine {
    store: Arc<Store>,
    schemas: Arc<SchemaRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<Store>, schemas: Arc<SchemaRegistry>, config: EngineConfig) -> Self {
        Self { store, schemas, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Decide every action in `input` without external cancellation.
    pub fn check(&self, input: &CheckInput) -> ArbiterResult<CheckResult> {
        self.check_with_cancellation(input, &CancellationToken::new())
    }

    /// Decide every action in `input`, honouring `token` between rules and
    /// between scope levels. On cancellation no partial decision is
    /// returned.
    pub fn check_with_cancellation(
        &self,
        input: &CheckInput,
        token: &CancellationToken,
    ) -> ArbiterResult<CheckResult> {
        let snapshot = self.store.snapshot();
        let ctx = RequestContext::new(input, Utc::now());

        let principal_version = input
            .principal
            .policy_version
            .clone()
            .unwrap_or_else(|| self.config.default_policy_version.clone());
        let resource_version = input
            .resource
            .policy_version
            .clone()
            .unwrap_or_else(|| self.config.default_policy_version.clone());

        debug!(
            request_id = %input.request_id,
            principal = %input.principal.id,
            resource_kind = %input.resource.kind,
            actions = input.actions.len(),
            "check starting"
        );

        let principal_chain =
            snapshot.principal_chain(&input.principal.id, &principal_version, &input.principal.scope);
        let resource_chain =
            snapshot.resource_chain(&input.resource.kind, &resource_version, &input.resource.scope);

        // One memo table per unit: variable values are evaluated lazily and
        // shared across all actions of this request.
        let mut memos: HashMap<usize, RefCell<Vec<Option<Value>>>> = HashMap::new();
        for (idx, pp) in &principal_chain {
            memos.insert(*idx, RefCell::new(vec![None; pp.variables.programs.len()]));
        }
        for (idx, rp) in &resource_chain {
            memos.insert(*idx, RefCell::new(vec![None; rp.variables.programs.len()]));
        }

        let principal_roles: HashSet<String> = input.principal.roles.iter().cloned().collect();

        let mut trace: Vec<TraceEvent> = Vec::new();
        let mut outputs: Vec<OutputEntry> = Vec::new();
        let mut emitted_outputs: HashSet<String> = HashSet::new();
        let mut effective_derived_roles: BTreeSet<String> = BTreeSet::new();
        let mut activated_units: HashSet<usize> = HashSet::new();
        let mut entered_units: HashSet<usize> = HashSet::new();
        let mut actions: BTreeMap<String, ActionEffect> = BTreeMap::new();

        // Attribute validation runs once per request against the schemas of
        // the most specific resource policy in the chain.
        let mut validation_errors: Vec<AttrValidationError> = Vec::new();
        if self.config.schema_validation != SchemaEnforcement::None {
            if let Some((_, head)) = resource_chain.first() {
                if let Some(schemas) = &head.schemas {
                    validation_errors = self.validate_attributes(input, schemas)?;
                }
            }
        }
        if self.config.schema_validation == SchemaEnforcement::Error
            && !validation_errors.is_empty()
        {
            // Fail closed: every action is denied, carrying the errors.
            let (policy, scope) = resource_chain
                .first()
                .map(|(_, rp)| (rp.id.to_string(), rp.scope.clone()))
                .unwrap_or_else(|| (NO_MATCH.to_string(), String::new()));
            warn!(
                request_id = %input.request_id,
                violations = validation_errors.len(),
                "attribute validation failed in error mode; denying"
            );
            for action in &input.actions {
                actions.insert(
                    action.clone(),
                    ActionEffect {
                        effect: Effect::Deny,
                        policy: policy.clone(),
                        scope: scope.clone(),
                    },
                );
            }
            return Ok(CheckResult {
                request_id: input.request_id.clone(),
                resource: ResourceIdentifier {
                    kind: input.resource.kind.clone(),
                    policy_version: resource_version,
                    scope: input.resource.scope.clone(),
                },
                actions,
                effective_derived_roles: Vec::new(),
                validation_errors,
                outputs: Vec::new(),
                trace,
            });
        }

        for action in &input.actions {
            if token.is_canceled() {
                return Err(ArbiterError::Canceled);
            }

            let mut decided: Option<ActionEffect> = None;

            // ── Step 1: principal policies ───────────────────────────────
            'principal: for (idx, pp) in &principal_chain {
                if entered_units.insert(*idx) {
                    trace.push(TraceEvent::ScopeEntered { policy: pp.id.to_string() });
                }
                let memo = memos.get(idx).expect("memo exists for chain unit");
                let env = EvalEnv { ctx: &ctx, table: &pp.variables, memo };
                let policy_name = pp.id.to_string();

                for rule in &pp.rules {
                    if token.is_canceled() {
                        return Err(ArbiterError::Canceled);
                    }
                    if !rule.resource.matches(&input.resource.kind) {
                        continue;
                    }
                    for entry in &rule.actions {
                        if !entry.action.matches(action) {
                            continue;
                        }
                        let label = rule_label(&entry.name, entry.index);
                        match eval_condition(entry.condition.as_ref(), &env) {
                            Ok(true) => {
                                trace.push(TraceEvent::RuleMatched {
                                    policy: policy_name.clone(),
                                    rule: label,
                                    action: action.clone(),
                                    effect: entry.effect,
                                });
                                if let Some(program) = &entry.output {
                                    emit_output(
                                        program,
                                        &policy_name,
                                        entry.index,
                                        &env,
                                        &mut outputs,
                                        &mut emitted_outputs,
                                        &mut trace,
                                    );
                                }
                                decided = Some(ActionEffect {
                                    effect: entry.effect,
                                    policy: policy_name.clone(),
                                    scope: pp.scope.clone(),
                                });
                                break 'principal;
                            }
                            Ok(false) => trace.push(TraceEvent::RuleSkipped {
                                policy: policy_name.clone(),
                                rule: label,
                                reason: "condition not satisfied".to_string(),
                            }),
                            Err(error) => trace.push(TraceEvent::RuleErrored {
                                policy: policy_name.clone(),
                                rule: label,
                                error: error.to_string(),
                            }),
                        }
                    }
                }
            }

            // ── Step 2: resource policies ────────────────────────────────
            if decided.is_none() {
                'resource: for (idx, rp) in &resource_chain {
                    if token.is_canceled() {
                        return Err(ArbiterError::Canceled);
                    }
                    if entered_units.insert(*idx) {
                        trace.push(TraceEvent::ScopeEntered { policy: rp.id.to_string() });
                    }
                    if activated_units.insert(*idx) {
                        activate_derived_roles(
                            rp,
                            &ctx,
                            &principal_roles,
                            &mut effective_derived_roles,
                            &mut trace,
                        );
                    }

                    let memo = memos.get(idx).expect("memo exists for chain unit");
                    let env = EvalEnv { ctx: &ctx, table: &rp.variables, memo };
                    let policy_name = rp.id.to_string();

                    for rule in &rp.rules {
                        if token.is_canceled() {
                            return Err(ArbiterError::Canceled);
                        }
                        if !rule.actions.matches(action) {
                            continue;
                        }
                        let label = rule_label(&rule.name, rule.index);

                        if !rule_roles_apply(rule, &principal_roles, &effective_derived_roles) {
                            trace.push(TraceEvent::RuleSkipped {
                                policy: policy_name.clone(),
                                rule: label,
                                reason: "no role overlap".to_string(),
                            });
                            continue;
                        }

                        match eval_condition(rule.condition.as_ref(), &env) {
                            Ok(true) => {
                                trace.push(TraceEvent::RuleMatched {
                                    policy: policy_name.clone(),
                                    rule: label,
                                    action: action.clone(),
                                    effect: rule.effect,
                                });
                                if let Some(program) = &rule.output {
                                    emit_output(
                                        program,
                                        &policy_name,
                                        rule.index,
                                        &env,
                                        &mut outputs,
                                        &mut emitted_outputs,
                                        &mut trace,
                                    );
                                }
                                decided = Some(ActionEffect {
                                    effect: rule.effect,
                                    policy: policy_name.clone(),
                                    scope: rp.scope.clone(),
                                });
                                break 'resource;
                            }
                            Ok(false) => trace.push(TraceEvent::RuleSkipped {
                                policy: policy_name.clone(),
                                rule: label,
                                reason: "condition not satisfied".to_string(),
                            }),
                            Err(error) => trace.push(TraceEvent::RuleErrored {
                                policy: policy_name.clone(),
                                rule: label,
                                error: error.to_string(),
                            }),
                        }
                    }
                }
            }

            // ── Step 3: deny by default ──────────────────────────────────
            let effect = decided.unwrap_or_else(|| {
                trace.push(TraceEvent::DefaultDenied { action: action.clone() });
                match resource_chain.first() {
                    // A policy for this resource exists; the deny is
                    // attributed to the most specific one consulted.
                    Some((_, rp)) => ActionEffect {
                        effect: Effect::Deny,
                        policy: rp.id.to_string(),
                        scope: rp.scope.clone(),
                    },
                    None => ActionEffect {
                        effect: Effect::Deny,
                        policy: NO_MATCH.to_string(),
                        scope: String::new(),
                    },
                }
            });

            debug!(
                request_id = %input.request_id,
                action = %action,
                effect = ?effect.effect,
                policy = %effect.policy,
                "action decided"
            );
            actions.insert(action.clone(), effect);
        }

        Ok(CheckResult {
            request_id: input.request_id.clone(),
            resource: ResourceIdentifier {
                kind: input.resource.kind.clone(),
                policy_version: resource_version,
                scope: input.resource.scope.clone(),
            },
            actions,
            effective_derived_roles: effective_derived_roles.into_iter().collect(),
            validation_errors,
            outputs,
            trace,
        })
    }

    fn validate_attributes(
        &self,
        input: &CheckInput,
        schemas: &PolicySchemas,
    ) -> ArbiterResult<Vec<AttrValidationError>> {
        let mut errors = Vec::new();
        if let Some(principal_schema) = &schemas.principal_schema {
            let attrs = attr_json(&input.principal.attr);
            errors.extend(self.schemas.validate(
                &principal_schema.reference,
                ValidationSource::Principal,
                &attrs,
            )?);
        }
        if let Some(resource_schema) = &schemas.resource_schema {
            let attrs = attr_json(&input.resource.attr);
            errors.extend(self.schemas.validate(
                &resource_schema.reference,
                ValidationSource::Resource,
                &attrs,
            )?);
        }
        Ok(errors)
    }
}

fn attr_json(attrs: &BTreeMap<String, serde_json::Value>) -> serde_json::Value {
    serde_json::Value::Object(
        attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn rule_label(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("#{index}")
    } else {
        name.to_string()
    }
}

/// Role gate for a resource rule: base roles against the principal's roles
/// (with `*` matching any), derived roles against the activated set.
fn rule_roles_apply(
    rule: &CompiledResourceRule,
    principal_roles: &HashSet<String>,
    effective_derived_roles: &BTreeSet<String>,
) -> bool {
    if rule.roles.contains("*") {
        return true;
    }
    if rule.roles.iter().any(|r| principal_roles.contains(r)) {
        return true;
    }
    rule.derived_roles
        .iter()
        .any(|r| effective_derived_roles.contains(r))
}

/// Activate the derived roles of one policy: parent roles must intersect
/// the principal's roles and the activation condition (if any) must hold.
///
/// Conditions evaluate under the defining set's variable table with a fresh
/// memo — activation happens once per unit per request.
fn activate_derived_roles(
    rp: &CompiledResourcePolicy,
    ctx: &RequestContext,
    principal_roles: &HashSet<String>,
    effective: &mut BTreeSet<String>,
    trace: &mut Vec<TraceEvent>,
) {
    for dr in &rp.derived_roles {
        if !dr.parent_roles.iter().any(|r| principal_roles.contains(r)) {
            trace.push(TraceEvent::DerivedRoleSkipped {
                role: dr.name.clone(),
                reason: "no parent role held".to_string(),
            });
            continue;
        }

        let activated = match &dr.condition {
            None => Ok(true),
            Some(condition) => {
                let memo = RefCell::new(vec![None; dr.variables.programs.len()]);
                let env = EvalEnv { ctx, table: &dr.variables, memo: &memo };
                eval_match(condition, &env)
            }
        };

        match activated {
            Ok(true) => {
                if effective.insert(dr.name.clone()) {
                    trace.push(TraceEvent::DerivedRoleActivated { role: dr.name.clone() });
                }
            }
            Ok(false) => trace.push(TraceEvent::DerivedRoleSkipped {
                role: dr.name.clone(),
                reason: "condition not satisfied".to_string(),
            }),
            Err(error) => trace.push(TraceEvent::DerivedRoleSkipped {
                role: dr.name.clone(),
                reason: format!("condition errored: {error}"),
            }),
        }
    }
}

fn eval_condition(
    condition: Option<&CompiledMatch>,
    env: &dyn Environment,
) -> ArbiterResult<bool> {
    match condition {
        None => Ok(true),
        Some(node) => eval_match(node, env),
    }
}

/// Evaluate a match tree with short-circuiting.
fn eval_match(node: &CompiledMatch, env: &dyn Environment) -> ArbiterResult<bool> {
    match node {
        CompiledMatch::All(children) => {
            for child in children {
                if !eval_match(child, env)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        CompiledMatch::Any(children) => {
            for child in children {
                if eval_match(child, env)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        CompiledMatch::None(children) => {
            for child in children {
                if eval_match(child, env)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        CompiledMatch::Expr(program) => evaluate_bool(program, env),
    }
}

/// Evaluate a rule's output expression after its effect is decided.
/// Expression errors land in the trace; the effect stands either way.
fn emit_output(
    program: &arbiter_expr::Program,
    policy: &str,
    rule_index: usize,
    env: &dyn Environment,
    outputs: &mut Vec<OutputEntry>,
    emitted: &mut HashSet<String>,
    trace: &mut Vec<TraceEvent>,
) {
    let src = format!("{policy}#{rule_index}");
    if !emitted.insert(src.clone()) {
        return;
    }
    match evaluate(program, env) {
        Ok(value) => outputs.push(OutputEntry { src, val: value.to_json() }),
        Err(error) => trace.push(TraceEvent::OutputErrored {
            src,
            error: error.to_string(),
        }),
    }
}

/// Request-scoped bindings shared by every condition evaluated for one
/// check: the `request` document and its `R`/`P` aliases, plus the
/// request-start timestamp.
pub(crate) struct RequestContext {
    pub request: Value,
    pub principal: Value,
    pub resource: Value,
    pub now: DateTime<Utc>,
}

impl RequestContext {
    pub(crate) fn new(input: &CheckInput, now: DateTime<Utc>) -> Self {
        let mut principal = BTreeMap::new();
        principal.insert("id".to_string(), Value::String(input.principal.id.clone()));
        principal.insert(
            "roles".to_string(),
            Value::List(
                input
                    .principal
                    .roles
                    .iter()
                    .map(|r| Value::String(r.clone()))
                    .collect(),
            ),
        );
        if let Some(version) = &input.principal.policy_version {
            principal.insert("policyVersion".to_string(), Value::String(version.clone()));
        }
        if !input.principal.scope.is_empty() {
            principal.insert("scope".to_string(), Value::String(input.principal.scope.clone()));
        }
        principal.insert("attr".to_string(), map_value(&input.principal.attr));
        let principal = Value::Map(principal);

        let mut resource = BTreeMap::new();
        resource.insert("kind".to_string(), Value::String(input.resource.kind.clone()));
        resource.insert("id".to_string(), Value::String(input.resource.id.clone()));
        if let Some(version) = &input.resource.policy_version {
            resource.insert("policyVersion".to_string(), Value::String(version.clone()));
        }
        if !input.resource.scope.is_empty() {
            resource.insert("scope".to_string(), Value::String(input.resource.scope.clone()));
        }
        resource.insert("attr".to_string(), map_value(&input.resource.attr));
        let resource = Value::Map(resource);

        let mut aux = BTreeMap::new();
        aux.insert(
            "jwt".to_string(),
            input
                .aux_data
                .as_ref()
                .map(|a| map_value(&a.jwt))
                .unwrap_or_else(|| Value::Map(BTreeMap::new())),
        );

        let mut request = BTreeMap::new();
        request.insert("principal".to_string(), principal.clone());
        request.insert("resource".to_string(), resource.clone());
        request.insert("auxData".to_string(), Value::Map(aux));

        Self {
            request: Value::Map(request),
            principal,
            resource,
            now,
        }
    }
}

fn map_value(attrs: &BTreeMap<String, serde_json::Value>) -> Value {
    Value::Map(
        attrs
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect(),
    )
}

/// The [`Environment`] for one policy's expressions: request bindings plus
/// the policy's variable slots, memoized per request.
pub(crate) struct EvalEnv<'a> {
    pub ctx: &'a RequestContext,
    pub table: &'a VariableTable,
    pub memo: &'a RefCell<Vec<Option<Value>>>,
}

impl Environment for EvalEnv<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "request" => Some(self.ctx.request.clone()),
            "R" => Some(self.ctx.resource.clone()),
            "P" => Some(self.ctx.principal.clone()),
            _ => None,
        }
    }

    fn variable(&self, slot: usize) -> ArbiterResult<Value> {
        if let Some(Some(value)) = self.memo.borrow().get(slot) {
            return Ok(value.clone());
        }
        let program = self.table.programs.get(slot).ok_or_else(|| {
            ArbiterError::ExprEval {
                message: format!("variable slot {slot} out of range"),
            }
        })?;
        // The borrow is released before re-entering the VM: variable
        // definitions may reference other variables (acyclic by
        // construction).
        let value = evaluate(program, self)?;
        if let Some(entry) = self.memo.borrow_mut().get_mut(slot) {
            *entry = Some(value.clone());
        }
        Ok(value)
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.now
    }
}
