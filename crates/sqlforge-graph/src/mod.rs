//! Dependency Graph (C4, spec §4.4). Deliberately hand-rolled rather than
//! built on a generic graph crate (spec §9 Design Notes: "adjacency sets
//! keyed by model name; transitive closures cached separately; invalidate
//! on any mutation").

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use sqlforge_common::errors::{EngineError, EngineResult};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// forward[A] = the set of vertices A depends on.
    forward: BTreeMap<String, BTreeSet<String>>,
    /// reverse[B] = the set of vertices that depend on B.
    reverse: BTreeMap<String, BTreeSet<String>>,
    deps_memo: RefCell<BTreeMap<String, BTreeSet<String>>>,
    dependents_memo: RefCell<BTreeMap<String, BTreeSet<String>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertices(&self) -> impl Iterator<Item = &String> {
        self.forward.keys()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.forward.contains_key(name)
    }

    /// Ensure `name` exists as a vertex with no edges yet, if not already
    /// present.
    pub fn ensure_vertex(&mut self, name: &str) {
        self.forward.entry(name.to_string()).or_default();
        self.reverse.entry(name.to_string()).or_default();
        self.invalidate_caches();
    }

    /// `from` depends on `to`. Both vertices are created if absent (spec
    /// §4.4 invariant "every edge target must exist in the registry" is
    /// enforced by [`sync_from_registry`](Self::sync_from_registry), the
    /// path every caller outside tests should use).
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.forward
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.reverse
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
        self.forward.entry(to.to_string()).or_default();
        self.reverse.entry(from.to_string()).or_default();
        self.invalidate_caches();
    }

    /// Remove a vertex and every edge touching it (spec §4.4
    /// `remove_vertex(n)`).
    pub fn remove_vertex(&mut self, name: &str) {
        if let Some(targets) = self.forward.remove(name) {
            for target in &targets {
                if let Some(incoming) = self.reverse.get_mut(target) {
                    incoming.remove(name);
                }
            }
        }
        if let Some(sources) = self.reverse.remove(name) {
            for source in &sources {
                if let Some(outgoing) = self.forward.get_mut(source) {
                    outgoing.remove(name);
                }
            }
        }
        self.invalidate_caches();
    }

    /// Rebuild the graph from a dependency map, validating every edge
    /// target exists in `known` (spec §4.4 invariant; surfaces
    /// `MissingModelError` otherwise, spec §7).
    pub fn sync_from_registry(
        &mut self,
        dependencies: &BTreeMap<String, BTreeSet<String>>,
        known: &BTreeSet<String>,
    ) -> EngineResult<()> {
        for (from, targets) in dependencies {
            for to in targets {
                if !known.contains(to) {
                    return Err(EngineError::MissingModelError(to.clone()));
                }
            }
            let _ = from;
        }
        self.forward.clear();
        self.reverse.clear();
        for name in known {
            self.ensure_vertex(name);
        }
        for (from, targets) in dependencies {
            for to in targets {
                self.add_edge(from, to);
            }
        }
        Ok(())
    }

    fn invalidate_caches(&mut self) {
        self.deps_memo.borrow_mut().clear();
        self.dependents_memo.borrow_mut().clear();
    }

    /// Kahn's algorithm: vertices with in-degree zero (no remaining
    /// unresolved dependency) form the next batch, alphabetically ordered
    /// (spec §4.4: deterministic tie-break). Fails `CycleError` if any
    /// vertex is never removed.
    pub fn topological_batches(&self) -> EngineResult<Vec<Vec<String>>> {
        let mut remaining_deps: BTreeMap<String, BTreeSet<String>> = self.forward.clone();
        let mut batches = Vec::new();
        let mut emitted = 0usize;
        let total = remaining_deps.len();

        while emitted < total {
            let ready: Vec<String> = remaining_deps
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            if ready.is_empty() {
                let cycle: Vec<String> = remaining_deps.keys().cloned().collect();
                return Err(EngineError::CycleError { cycle });
            }
            let mut batch = ready;
            batch.sort();
            for name in &batch {
                remaining_deps.remove(name);
            }
            for deps in remaining_deps.values_mut() {
                for name in &batch {
                    deps.remove(name);
                }
            }
            emitted += batch.len();
            batches.push(batch);
        }
        Ok(batches)
    }

    /// All transitive dependencies of `name` (spec §4.4), memoised until
    /// the next mutation.
    pub fn transitive_deps(&self, name: &str) -> BTreeSet<String> {
        if let Some(cached) = self.deps_memo.borrow().get(name) {
            return cached.clone();
        }
        let mut visited = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(direct) = self.forward.get(&current) {
                for dep in direct {
                    if visited.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        self.deps_memo
            .borrow_mut()
            .insert(name.to_string(), visited.clone());
        visited
    }

    /// All transitive dependents of `name`: every vertex that would be
    /// affected if `name` changed (spec §4.4, used by the Planner's
    /// `UPSTREAM_CHANGED` propagation, §4.6).
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        if let Some(cached) = self.dependents_memo.borrow().get(name) {
            return cached.clone();
        }
        let mut visited = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(incoming) = self.reverse.get(&current) {
                for dependent in incoming {
                    if visited.insert(dependent.clone()) {
                        stack.push(dependent.clone());
                    }
                }
            }
        }
        self.dependents_memo
            .borrow_mut()
            .insert(name.to_string(), visited.clone());
        visited
    }

    /// Render as Graphviz `dot` text (SPEC_FULL.md §B: `deps --format
    /// dot`).
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph sqlforge {\n");
        for (from, targets) in &self.forward {
            if targets.is_empty() {
                out.push_str(&format!("  \"{from}\";\n"));
            }
            for to in targets {
                out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
            }
        }
        out.push('}');
        out.push('\n');
        out
    }
}
