//! The index: canonical store of compilation units with atomic snapshot
//! replacement.
//!
//! Readers grab an `Arc<Snapshot>` once per request and evaluate against it
//! for the request's whole lifetime; a snapshot published mid-evaluation is
//! invisible to them. The previous snapshot stays alive until its last
//! reader drops the `Arc`. Writers serialize admissions outside this type —
//! `publish` itself is a single atomic pointer swap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use arbiter_contracts::policy::PolicyId;

use crate::compile::{CompiledPolicy, CompiledPrincipalPolicy, CompiledResourcePolicy};

/// An immutable set of compilation units.
#[derive(Debug, Default)]
pub struct Snapshot {
    units: Vec<CompiledPolicy>,
    by_id: HashMap<String, usize>,
}

impl Snapshot {
    /// A snapshot with no policies; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn new(units: Vec<CompiledPolicy>) -> Self {
        let by_id = units
            .iter()
            .enumerate()
            .map(|(i, unit)| (unit.id().to_string(), i))
            .collect();
        Self { units, by_id }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Look up a unit by policy identity.
    pub fn get(&self, id: &PolicyId) -> Option<&CompiledPolicy> {
        self.by_id.get(&id.to_string()).map(|&i| &self.units[i])
    }

    /// Look up a unit by snapshot index (scope-parent pointers are indices).
    pub fn get_by_index(&self, index: usize) -> Option<&CompiledPolicy> {
        self.units.get(index)
    }

    /// Every unit identity in this snapshot, in admission order.
    pub fn ids(&self) -> impl Iterator<Item = &PolicyId> {
        self.units.iter().map(|unit| unit.id())
    }

    /// The import closure of a top-level policy.
    pub fn dependencies(&self, id: &PolicyId) -> Option<&[PolicyId]> {
        self.get(id).map(CompiledPolicy::dependencies)
    }

    /// The resource-policy scope chain for a request, most specific first.
    ///
    /// The head is the densest scope prefix of `scope` with a policy
    /// present; the rest follows the precomputed parent indices.
    pub fn resource_chain(
        &self,
        kind: &str,
        version: &str,
        scope: &str,
    ) -> Vec<(usize, &CompiledResourcePolicy)> {
        let id = PolicyId::Resource {
            kind: kind.to_string(),
            version: version.to_string(),
            scope: scope.to_string(),
        };
        self.chain(&id)
            .into_iter()
            .filter_map(|(i, unit)| match unit {
                CompiledPolicy::Resource(rp) => Some((i, rp)),
                CompiledPolicy::Principal(_) => None,
            })
            .collect()
    }

    /// The principal-policy scope chain for a request, most specific first.
    pub fn principal_chain(
        &self,
        principal: &str,
        version: &str,
        scope: &str,
    ) -> Vec<(usize, &CompiledPrincipalPolicy)> {
        let id = PolicyId::Principal {
            principal: principal.to_string(),
            version: version.to_string(),
            scope: scope.to_string(),
        };
        self.chain(&id)
            .into_iter()
            .filter_map(|(i, unit)| match unit {
                CompiledPolicy::Principal(pp) => Some((i, pp)),
                CompiledPolicy::Resource(_) => None,
            })
            .collect()
    }

    /// Walk scope prefixes until a unit is found, then follow parents.
    fn chain(&self, id: &PolicyId) -> Vec<(usize, &CompiledPolicy)> {
        let mut head = None;
        let mut scope = id.scope().to_string();
        loop {
            if let Some(&idx) = self.by_id.get(&id.at_scope(&scope).to_string()) {
                head = Some(idx);
                break;
            }
            if scope.is_empty() {
                break;
            }
            scope = match scope.rfind('.') {
                Some(dot) => scope[..dot].to_string(),
                None => String::new(),
            };
        }

        let mut chain = Vec::new();
        let mut current = head;
        while let Some(idx) = current {
            let unit = &self.units[idx];
            chain.push((idx, unit));
            current = unit.parent();
        }
        chain
    }
}

/// The shared, hot-swappable snapshot holder.
#[derive(Default)]
pub struct Store {
    current: ArcSwap<Snapshot>,
}

impl Store {
    /// A store holding an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. The returned handle stays valid (and its
    /// contents unchanged) across any number of subsequent publishes.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Atomically replace the current snapshot.
    pub fn publish(&self, snapshot: Snapshot) {
        let unit_count = snapshot.len();
        self.current.store(Arc::new(snapshot));
        debug!(units = unit_count, "snapshot published");
    }
}
