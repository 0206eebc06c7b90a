//! The policy compiler: AST in, lookup-optimized compilation units out.
//!
//! Compilation resolves every import up front so evaluation never chases a
//! reference: derived-role definitions are denormalized into the importing
//! resource policy, variable definitions are merged (locals shadow imports)
//! into a slot table with cycle detection, action globs are precompiled,
//! and scope parents are linked as indices into the snapshot.
//!
//! A failure in one policy rejects that policy set; the admitter keeps the
//! previous snapshot, so other units remain usable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::policy::{
    Condition, Effect, Match, PolicyId, PolicySchemas, Variables,
};
use arbiter_expr::{compile as compile_expr, CompileContext, Expr, Program};
use arbiter_policy::Policy;

use crate::index::Snapshot;

/// The variable slot table for one policy: the merged, cycle-checked
/// variable set, compiled and addressable by slot index.
///
/// Slots are assigned in sorted name order, so identical variable sets
/// always produce identical tables.
#[derive(Debug)]
pub struct VariableTable {
    pub slots: BTreeMap<String, usize>,
    /// One program per slot; evaluated lazily and memoized per request.
    pub programs: Vec<Program>,
}

impl VariableTable {
    /// An empty table, for policies with no variables.
    pub fn empty() -> Self {
        Self { slots: BTreeMap::new(), programs: Vec::new() }
    }

    /// The parsed definition of a variable, by name. Used by the planner.
    pub fn ast(&self, name: &str) -> Option<&Expr> {
        let slot = self.slots.get(name)?;
        self.programs.get(*slot).map(|p| &p.ast)
    }
}

/// A precompiled action matcher: literal hash-set fast path plus compiled
/// glob patterns.
#[derive(Debug)]
pub struct ActionMatcher {
    literals: HashSet<String>,
    globs: Vec<glob::Pattern>,
    match_all: bool,
}

impl ActionMatcher {
    pub fn new(patterns: &[String]) -> ArbiterResult<Self> {
        let mut matcher = Self {
            literals: HashSet::new(),
            globs: Vec::new(),
            match_all: false,
        };
        for pattern in patterns {
            if pattern == "*" {
                matcher.match_all = true;
            } else if pattern.contains(['*', '?', '[']) {
                let compiled = glob::Pattern::new(pattern).map_err(|e| {
                    ArbiterError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    }
                })?;
                matcher.globs.push(compiled);
            } else {
                matcher.literals.insert(pattern.clone());
            }
        }
        Ok(matcher)
    }

    pub fn matches(&self, action: &str) -> bool {
        self.match_all
            || self.literals.contains(action)
            || self.globs.iter().any(|g| g.matches(action))
    }
}

/// A compiled condition tree, mirroring [`Match`] with compiled programs at
/// the leaves.
#[derive(Debug)]
pub enum CompiledMatch {
    All(Vec<CompiledMatch>),
    Any(Vec<CompiledMatch>),
    None(Vec<CompiledMatch>),
    Expr(Program),
}

/// One denormalized derived-role definition, carried by every resource
/// policy that imports its set.
///
/// The condition evaluates under the *defining* set's variable table, not
/// the importer's.
#[derive(Debug)]
pub struct CompiledDerivedRole {
    pub name: String,
    pub parent_roles: HashSet<String>,
    pub condition: Option<CompiledMatch>,
    pub variables: Arc<VariableTable>,
}

/// One compiled resource rule.
#[derive(Debug)]
pub struct CompiledResourceRule {
    pub name: String,
    /// Declaration index, used in output provenance (`policy#index`).
    pub index: usize,
    pub actions: ActionMatcher,
    pub roles: HashSet<String>,
    pub derived_roles: HashSet<String>,
    pub condition: Option<CompiledMatch>,
    pub effect: Effect,
    pub output: Option<Program>,
}

/// A compiled resource policy: the evaluable unit for one
/// `(kind, version, scope)`.
#[derive(Debug)]
pub struct CompiledResourcePolicy {
    pub id: PolicyId,
    pub hash: u64,
    pub kind: String,
    pub version: String,
    pub scope: String,
    /// Index of the parent-scope unit within the snapshot, if any.
    pub parent: Option<usize>,
    pub variables: Arc<VariableTable>,
    pub derived_roles: Vec<CompiledDerivedRole>,
    pub rules: Vec<CompiledResourceRule>,
    pub schemas: Option<PolicySchemas>,
    /// Full import closure: derived-role sets and export-variable sets.
    pub dependencies: Vec<PolicyId>,
}

/// One compiled principal action entry.
#[derive(Debug)]
pub struct CompiledPrincipalAction {
    pub name: String,
    /// Ordinal across the policy's action entries, for output provenance.
    pub index: usize,
    pub action: ActionMatcher,
    pub effect: Effect,
    pub condition: Option<CompiledMatch>,
    pub output: Option<Program>,
}

/// One compiled principal rule: a resource-kind matcher plus its ordered
/// action entries.
#[derive(Debug)]
pub struct CompiledPrincipalRule {
    pub resource: ActionMatcher,
    pub actions: Vec<CompiledPrincipalAction>,
}

/// A compiled principal policy for one `(principal, version, scope)`.
#[derive(Debug)]
pub struct CompiledPrincipalPolicy {
    pub id: PolicyId,
    pub hash: u64,
    pub principal: String,
    pub version: String,
    pub scope: String,
    pub parent: Option<usize>,
    pub variables: Arc<VariableTable>,
    pub rules: Vec<CompiledPrincipalRule>,
    pub dependencies: Vec<PolicyId>,
}

/// A compilation unit: one evaluable top-level policy.
#[derive(Debug)]
pub enum CompiledPolicy {
    Resource(CompiledResourcePolicy),
    Principal(CompiledPrincipalPolicy),
}

impl CompiledPolicy {
    pub fn id(&self) -> &PolicyId {
        match self {
            CompiledPolicy::Resource(rp) => &rp.id,
            CompiledPolicy::Principal(pp) => &pp.id,
        }
    }

    pub fn parent(&self) -> Option<usize> {
        match self {
            CompiledPolicy::Resource(rp) => rp.parent,
            CompiledPolicy::Principal(pp) => pp.parent,
        }
    }

    pub fn dependencies(&self) -> &[PolicyId] {
        match self {
            CompiledPolicy::Resource(rp) => &rp.dependencies,
            CompiledPolicy::Principal(pp) => &pp.dependencies,
        }
    }
}

/// Compile a policy set into a publishable snapshot.
///
/// Duplicate identities, missing imports, variable cycles, and bad patterns
/// all fail compilation; nothing is partially admitted.
pub fn compile(policies: &[Policy]) -> ArbiterResult<Snapshot> {
    // Pass 1: index definition policies and detect duplicate identities.
    let mut seen: HashSet<PolicyId> = HashSet::new();
    for policy in policies {
        if !seen.insert(policy.id.clone()) {
            return Err(ArbiterError::DuplicatePolicy { id: policy.id.to_string() });
        }
    }

    let mut derived_role_sets = HashMap::new();
    let mut export_sets = HashMap::new();
    for policy in policies {
        if let Some(dr) = &policy.document.derived_roles {
            derived_role_sets.insert(dr.name.clone(), dr);
        }
        if let Some(ev) = &policy.document.export_variables {
            export_sets.insert(ev.name.clone(), ev);
        }
    }

    let resolver = Resolver { derived_role_sets, export_sets };

    // Pass 2: compile each top-level policy into a unit.
    let mut units: Vec<CompiledPolicy> = Vec::new();
    for policy in policies {
        if let Some(rp) = &policy.document.resource_policy {
            units.push(CompiledPolicy::Resource(resolver.resource_policy(
                policy, rp,
            )?));
        } else if let Some(pp) = &policy.document.principal_policy {
            units.push(CompiledPolicy::Principal(resolver.principal_policy(
                policy, pp,
            )?));
        }
    }

    // Pass 3: link scope parents as snapshot indices.
    link_parents(&mut units);

    debug!(units = units.len(), "policy set compiled");
    Ok(Snapshot::new(units))
}

struct Resolver<'a> {
    derived_role_sets: HashMap<String, &'a arbiter_contracts::policy::DerivedRoles>,
    export_sets: HashMap<String, &'a arbiter_contracts::policy::ExportVariables>,
}

impl Resolver<'_> {
    fn resource_policy(
        &self,
        policy: &Policy,
        rp: &arbiter_contracts::policy::ResourcePolicy,
    ) -> ArbiterResult<CompiledResourcePolicy> {
        let owner = policy.id.to_string();
        let variables = Arc::new(self.variable_table(&rp.variables, &owner)?);
        let mut dependencies: Vec<PolicyId> = rp
            .variables
            .import
            .iter()
            .map(|name| PolicyId::ExportVariables { name: name.clone() })
            .collect();

        // Denormalize derived roles from every imported set, in import
        // order then definition order.
        let mut derived_roles = Vec::new();
        let mut defined_names: HashSet<&str> = HashSet::new();
        for set_name in &rp.import_derived_roles {
            let set = self.derived_role_sets.get(set_name).ok_or_else(|| {
                ArbiterError::MissingImport {
                    kind: "derived roles".to_string(),
                    name: set_name.clone(),
                    importer: owner.clone(),
                }
            })?;
            dependencies.push(PolicyId::DerivedRoles { name: set_name.clone() });
            dependencies.extend(
                set.variables
                    .import
                    .iter()
                    .map(|name| PolicyId::ExportVariables { name: name.clone() }),
            );

            let set_owner = PolicyId::DerivedRoles { name: set.name.clone() }.to_string();
            let set_variables = Arc::new(self.variable_table(&set.variables, &set_owner)?);
            for def in &set.definitions {
                defined_names.insert(def.name.as_str());
                derived_roles.push(CompiledDerivedRole {
                    name: def.name.clone(),
                    parent_roles: def.parent_roles.iter().cloned().collect(),
                    condition: self
                        .condition(def.condition.as_ref(), &set_variables, &set_owner)?,
                    variables: Arc::clone(&set_variables),
                });
            }
        }

        let mut rules = Vec::with_capacity(rp.rules.len());
        for (index, rule) in rp.rules.iter().enumerate() {
            // Rules may only reference derived roles that resolve through
            // the policy's imports.
            for reference in &rule.derived_roles {
                if !defined_names.contains(reference.as_str()) {
                    return Err(ArbiterError::MissingImport {
                        kind: "derived role".to_string(),
                        name: reference.clone(),
                        importer: owner.clone(),
                    });
                }
            }

            rules.push(CompiledResourceRule {
                name: rule.name.clone(),
                index,
                actions: ActionMatcher::new(&rule.actions)?,
                roles: rule.roles.iter().cloned().collect(),
                derived_roles: rule.derived_roles.iter().cloned().collect(),
                condition: self.condition(rule.condition.as_ref(), &variables, &owner)?,
                effect: rule.effect,
                output: rule
                    .output
                    .as_ref()
                    .map(|o| self.expr(&o.expr, &variables, &owner))
                    .transpose()?,
            });
        }

        dependencies.sort_by_key(ToString::to_string);
        dependencies.dedup();

        Ok(CompiledResourcePolicy {
            id: policy.id.clone(),
            hash: policy.hash,
            kind: rp.resource.clone(),
            version: rp.version.clone(),
            scope: rp.scope.clone(),
            parent: None,
            variables,
            derived_roles,
            rules,
            schemas: rp.schemas.clone(),
            dependencies,
        })
    }

    fn principal_policy(
        &self,
        policy: &Policy,
        pp: &arbiter_contracts::policy::PrincipalPolicy,
    ) -> ArbiterResult<CompiledPrincipalPolicy> {
        let owner = policy.id.to_string();
        let variables = Arc::new(self.variable_table(&pp.variables, &owner)?);
        let mut dependencies: Vec<PolicyId> = pp
            .variables
            .import
            .iter()
            .map(|name| PolicyId::ExportVariables { name: name.clone() })
            .collect();
        dependencies.sort_by_key(ToString::to_string);
        dependencies.dedup();

        let mut rules = Vec::with_capacity(pp.rules.len());
        let mut ordinal = 0;
        for rule in &pp.rules {
            let mut actions = Vec::with_capacity(rule.actions.len());
            for entry in &rule.actions {
                actions.push(CompiledPrincipalAction {
                    name: entry.name.clone(),
                    index: ordinal,
                    action: ActionMatcher::new(std::slice::from_ref(&entry.action))?,
                    effect: entry.effect,
                    condition: self.condition(entry.condition.as_ref(), &variables, &owner)?,
                    output: entry
                        .output
                        .as_ref()
                        .map(|o| self.expr(&o.expr, &variables, &owner))
                        .transpose()?,
                });
                ordinal += 1;
            }
            rules.push(CompiledPrincipalRule {
                resource: ActionMatcher::new(std::slice::from_ref(&rule.resource))?,
                actions,
            });
        }

        Ok(CompiledPrincipalPolicy {
            id: policy.id.clone(),
            hash: policy.hash,
            principal: pp.principal.clone(),
            version: pp.version.clone(),
            scope: pp.scope.clone(),
            parent: None,
            variables,
            rules,
            dependencies,
        })
    }

    /// Merge imported and local variables into a compiled slot table.
    ///
    /// Imports are applied in import order, locals last — a local name
    /// shadows an imported one. The merged definition closure must be
    /// acyclic.
    fn variable_table(&self, variables: &Variables, owner: &str) -> ArbiterResult<VariableTable> {
        let mut sources: BTreeMap<String, String> = BTreeMap::new();
        for import in &variables.import {
            let set = self.export_sets.get(import).ok_or_else(|| {
                ArbiterError::MissingImport {
                    kind: "export variables".to_string(),
                    name: import.clone(),
                    importer: owner.to_string(),
                }
            })?;
            for (name, expr) in &set.definitions {
                sources.insert(name.clone(), expr.clone());
            }
        }
        for (name, expr) in &variables.local {
            sources.insert(name.clone(), expr.clone());
        }

        if sources.is_empty() {
            return Ok(VariableTable::empty());
        }

        // Parse first so dependency extraction and compilation share ASTs.
        let mut asts: BTreeMap<String, Expr> = BTreeMap::new();
        for (name, source) in &sources {
            asts.insert(name.clone(), arbiter_expr::parse(source)?);
        }

        check_variable_cycles(&asts)?;

        let slots: BTreeMap<String, usize> = sources
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let ctx = CompileContext { variables: &slots, owner };
        let mut programs = Vec::with_capacity(sources.len());
        for (name, source) in &sources {
            let ast = asts.remove(name).unwrap_or(Expr::Lit(
                arbiter_contracts::value::Value::Null,
            ));
            programs.push(arbiter_expr::compile_ast(ast, source, &ctx)?);
        }

        Ok(VariableTable { slots, programs })
    }

    fn condition(
        &self,
        condition: Option<&Condition>,
        variables: &Arc<VariableTable>,
        owner: &str,
    ) -> ArbiterResult<Option<CompiledMatch>> {
        condition
            .map(|c| self.match_node(&c.match_, variables, owner))
            .transpose()
    }

    fn match_node(
        &self,
        node: &Match,
        variables: &Arc<VariableTable>,
        owner: &str,
    ) -> ArbiterResult<CompiledMatch> {
        Ok(match node {
            Match::All(children) => CompiledMatch::All(
                children
                    .iter()
                    .map(|c| self.match_node(c, variables, owner))
                    .collect::<ArbiterResult<_>>()?,
            ),
            Match::Any(children) => CompiledMatch::Any(
                children
                    .iter()
                    .map(|c| self.match_node(c, variables, owner))
                    .collect::<ArbiterResult<_>>()?,
            ),
            Match::None(children) => CompiledMatch::None(
                children
                    .iter()
                    .map(|c| self.match_node(c, variables, owner))
                    .collect::<ArbiterResult<_>>()?,
            ),
            Match::Expr(source) => CompiledMatch::Expr(self.expr(source, variables, owner)?),
        })
    }

    fn expr(
        &self,
        source: &str,
        variables: &Arc<VariableTable>,
        owner: &str,
    ) -> ArbiterResult<Program> {
        let ctx = CompileContext { variables: &variables.slots, owner };
        compile_expr(source, &ctx)
    }
}

/// Reject cyclic variable definitions with the cycle's member names.
fn check_variable_cycles(asts: &BTreeMap<String, Expr>) -> ArbiterResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Visiting,
        Done,
    }

    fn references(expr: &Expr, out: &mut Vec<String>) {
        match expr {
            Expr::Member(obj, field) => {
                if matches!(obj.as_ref(), Expr::Ident(root) if root == "variables") {
                    out.push(field.clone());
                } else {
                    references(obj, out);
                }
            }
            Expr::Index(a, b) | Expr::Binary(_, a, b) => {
                references(a, out);
                references(b, out);
            }
            Expr::Unary(_, inner) => references(inner, out),
            Expr::List(items) => items.iter().for_each(|i| references(i, out)),
            Expr::Map(entries) => entries.iter().for_each(|(_, v)| references(v, out)),
            Expr::Call(_, args) => args.iter().for_each(|a| references(a, out)),
            Expr::Method(recv, _, args) => {
                references(recv, out);
                args.iter().for_each(|a| references(a, out));
            }
            Expr::Lit(_) | Expr::Ident(_) => {}
        }
    }

    fn visit(
        name: &str,
        asts: &BTreeMap<String, Expr>,
        states: &mut HashMap<String, State>,
        stack: &mut Vec<String>,
    ) -> ArbiterResult<()> {
        match states.get(name) {
            Some(State::Done) => return Ok(()),
            Some(State::Visiting) => {
                let start = stack.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(name.to_string());
                return Err(ArbiterError::VariableCycle { names: cycle.join(" -> ") });
            }
            None => {}
        }

        states.insert(name.to_string(), State::Visiting);
        stack.push(name.to_string());

        if let Some(ast) = asts.get(name) {
            let mut refs = Vec::new();
            references(ast, &mut refs);
            for reference in refs {
                if asts.contains_key(&reference) {
                    visit(&reference, asts, states, stack)?;
                }
            }
        }

        stack.pop();
        states.insert(name.to_string(), State::Done);
        Ok(())
    }

    let mut states = HashMap::new();
    let mut stack = Vec::new();
    for name in asts.keys() {
        visit(name, asts, &mut states, &mut stack)?;
    }
    Ok(())
}

/// Link each scoped unit to its nearest ancestor within the same family.
fn link_parents(units: &mut [CompiledPolicy]) {
    // Identity → index, for ancestor lookup.
    let by_id: HashMap<String, usize> = units
        .iter()
        .enumerate()
        .map(|(i, unit)| (unit.id().to_string(), i))
        .collect();

    for i in 0..units.len() {
        let id = units[i].id().clone();
        let scope = id.scope().to_string();
        if scope.is_empty() {
            continue;
        }

        let mut parent = None;
        let mut current = scope.as_str();
        while let Some(dot) = current.rfind('.') {
            current = &current[..dot];
            if let Some(&idx) = by_id.get(&id.at_scope(current).to_string()) {
                parent = Some(idx);
                break;
            }
        }
        if parent.is_none() && !scope.is_empty() {
            if let Some(&idx) = by_id.get(&id.at_scope("").to_string()) {
                parent = Some(idx);
            }
        }

        match &mut units[i] {
            CompiledPolicy::Resource(rp) => rp.parent = parent,
            CompiledPolicy::Principal(pp) => pp.parent = parent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn action_matcher_fast_path_and_globs() {
        let matcher = ActionMatcher::new(&[
            "approve".to_string(),
            "view:*".to_string(),
        ])
        .unwrap();
        assert!(matcher.matches("approve"));
        assert!(matcher.matches("view:public"));
        assert!(!matcher.matches("view"));
        assert!(!matcher.matches("delete"));

        let wildcard = ActionMatcher::new(&["*".to_string()]).unwrap();
        assert!(wildcard.matches("anything"));
    }

    #[test]
    fn compiles_the_leave_request_bundle() {
        let snapshot = compile(&fixtures::leave_request_bundle()).unwrap();
        let id = PolicyId::Resource {
            kind: "leave_request".to_string(),
            version: "20210210".to_string(),
            scope: String::new(),
        };
        let unit = snapshot.get(&id).expect("resource policy compiled");
        match unit {
            CompiledPolicy::Resource(rp) => {
                // Derived roles are denormalized from the imported set.
                let names: Vec<&str> =
                    rp.derived_roles.iter().map(|d| d.name.as_str()).collect();
                assert!(names.contains(&"any_employee"));
                assert!(names.contains(&"direct_manager"));
                assert!(rp
                    .dependencies
                    .contains(&PolicyId::DerivedRoles { name: "beta".to_string() }));
            }
            CompiledPolicy::Principal(_) => panic!("expected a resource unit"),
        }
    }

    #[test]
    fn missing_derived_roles_import_fails() {
        let policies = fixtures::load_policies(&[fixtures::RESOURCE_POLICY_V20210210]);
        let err = compile(&policies).unwrap_err();
        match err {
            ArbiterError::MissingImport { kind, name, .. } => {
                assert_eq!(kind, "derived roles");
                assert_eq!(name, "beta");
            }
            other => panic!("expected MissingImport, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_derived_role_reference_fails() {
        let policies = fixtures::load_policies(&[
            fixtures::DERIVED_ROLES_BETA,
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: leave_request
  version: default
  importDerivedRoles: [beta]
  rules:
    - actions: ["view"]
      effect: EFFECT_ALLOW
      derivedRoles: [no_such_role]
"#,
        ]);
        let err = compile(&policies).unwrap_err();
        match err {
            ArbiterError::MissingImport { kind, name, .. } => {
                assert_eq!(kind, "derived role");
                assert_eq!(name, "no_such_role");
            }
            other => panic!("expected MissingImport, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_identity_fails() {
        let policies = fixtures::load_policies(&[
            fixtures::DERIVED_ROLES_BETA,
            fixtures::DERIVED_ROLES_BETA,
        ]);
        let err = compile(&policies).unwrap_err();
        assert!(matches!(err, ArbiterError::DuplicatePolicy { .. }));
    }

    #[test]
    fn variable_cycles_fail_compilation() {
        let policies = fixtures::load_policies(&[r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  variables:
    local:
      a: variables.b
      b: variables.a
  rules:
    - actions: ["view"]
      roles: ["user"]
      effect: EFFECT_ALLOW
"#]);
        let err = compile(&policies).unwrap_err();
        match err {
            ArbiterError::VariableCycle { names } => {
                assert!(names.contains('a') && names.contains('b'), "cycle: {names}");
            }
            other => panic!("expected VariableCycle, got {other:?}"),
        }
    }

    #[test]
    fn locals_shadow_imported_variables() {
        let policies = fixtures::load_policies(&[
            r#"
apiVersion: api.cerbos.dev/v1
exportVariables:
  name: common
  definitions:
    flagged: "false"
    limit: "10"
"#,
            r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: doc
  version: default
  variables:
    import: [common]
    local:
      flagged: "true"
  rules:
    - actions: ["view"]
      roles: ["user"]
      effect: EFFECT_ALLOW
      condition:
        match:
          expr: variables.flagged
"#,
        ]);
        let snapshot = compile(&policies).unwrap();
        let id = PolicyId::Resource {
            kind: "doc".to_string(),
            version: "default".to_string(),
            scope: String::new(),
        };
        match snapshot.get(&id).unwrap() {
            CompiledPolicy::Resource(rp) => {
                // Both names exist; the local definition replaced the import.
                assert_eq!(rp.variables.slots.len(), 2);
                let flagged = rp.variables.ast("flagged").unwrap();
                assert_eq!(flagged.to_string(), "true");
            }
            CompiledPolicy::Principal(_) => panic!("expected a resource unit"),
        }
    }

    #[test]
    fn scope_parents_link_to_nearest_ancestor() {
        let snapshot = compile(&fixtures::scoped_bundle()).unwrap();
        let child = PolicyId::Resource {
            kind: "leave_request".to_string(),
            version: "default".to_string(),
            scope: "acme.hr.uk".to_string(),
        };
        // acme.hr is absent, so acme.hr.uk links straight to acme.
        let child_idx_parent = match snapshot.get(&child).unwrap() {
            CompiledPolicy::Resource(rp) => rp.parent.expect("child has a parent"),
            CompiledPolicy::Principal(_) => panic!("expected a resource unit"),
        };
        let parent_unit = snapshot.get_by_index(child_idx_parent).unwrap();
        assert_eq!(
            parent_unit.id().to_string(),
            "resource.leave_request.vdefault/acme"
        );
    }
}
